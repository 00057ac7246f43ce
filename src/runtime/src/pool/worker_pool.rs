//! Bounded-concurrency worker pool with shared cooperative cancellation.
//!
//! Usage follows a "submit then seal" pattern:
//!
//! ```ignore
//! let pool = WorkerPool::new(4);
//! pool.add(|cancel| async move { do_work(cancel).await })?;
//! pool.done_adding_jobs();
//! pool.run().await?;
//! ```
//!
//! `run()` returns once the list is sealed and every task has finished, or
//! once a task fails and all in-flight tasks have unwound. Tasks that fail
//! with [`MergeError::Cancelled`] are never reported. A panicking task counts
//! as a failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rootmerge_core::error::{MergeError, Result};
use tokio::sync::{mpsc, watch};

type Job = Box<dyn FnOnce(CancelToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Owner side of a shared cancellation signal.
#[derive(Debug, Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Create a signal in the not-cancelled state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the signal. Every token observes it from now on.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been tripped.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Hand out a token observing this signal.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation token passed into every pool task.
///
/// Usable from both async code and blocking threads.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether the pool has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Return [`MergeError::Cancelled`] if the pool has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MergeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until the pool is cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Signal owner is gone; cancellation can no longer happen.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Bounded-concurrency task runner with shared cooperative cancellation.
pub struct WorkerPool {
    /// Maximum number of tasks running at once.
    concurrency: usize,
    /// Submission side; `None` once sealed.
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    /// Queue drained by the workers; taken by the first `run()`.
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    /// Shared cancellation signal for this run.
    canceller: Canceller,
}

impl WorkerPool {
    /// Create a pool running at most `concurrency` tasks at once.
    ///
    /// A concurrency of 0 is treated as 1.
    pub fn new(concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            concurrency: concurrency.max(1),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            canceller: Canceller::new(),
        }
    }

    /// Maximum number of tasks running at once.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Register a task.
    ///
    /// Fails with [`MergeError::PoolError`] once the list has been sealed
    /// with [`done_adding_jobs`](Self::done_adding_jobs).
    pub fn add<F, Fut>(&self, task: F) -> Result<()>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job: Job = Box::new(move |cancel| Box::pin(task(cancel)));
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(|| {
            MergeError::PoolError("cannot add jobs after done_adding_jobs".to_string())
        })?;
        sender
            .send(job)
            .map_err(|_| MergeError::PoolError("pool has already finished".to_string()))
    }

    /// Seal the task list. Workers exit once the queue is drained.
    pub fn done_adding_jobs(&self) {
        if self.sender.lock().take().is_some() {
            tracing::debug!("Worker pool sealed");
        }
    }

    /// Cancel the pool as if a task had failed.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Run every registered task and wait for the outcome.
    ///
    /// Returns the first non-cancellation error any task produced, after
    /// all running tasks have returned. Blocks until the list is sealed.
    pub async fn run(&self) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| MergeError::PoolError("pool has already been run".to_string()))?;
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let first_error: Arc<Mutex<Option<MergeError>>> = Arc::new(Mutex::new(None));

        tracing::debug!(concurrency = self.concurrency, "Worker pool started");

        let mut workers = Vec::with_capacity(self.concurrency);
        for worker in 0..self.concurrency {
            let receiver = Arc::clone(&receiver);
            let canceller = self.canceller.clone();
            let first_error = Arc::clone(&first_error);
            workers.push(tokio::spawn(async move {
                worker_loop(worker, receiver, canceller, first_error).await
            }));
        }

        // Every worker is joined, even after one dies, so no task outlives `run()`.
        for (worker, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                record_failure(
                    worker,
                    MergeError::PoolError(format!("worker task failed: {}", e)),
                    &self.canceller,
                    &first_error,
                );
            }
        }

        let err = first_error.lock().take();
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    canceller: Canceller,
    first_error: Arc<Mutex<Option<MergeError>>>,
) {
    let mut cancel = canceller.token();
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = cancel.cancelled() => None,
            }
        };
        let Some(job) = job else {
            break;
        };

        // Not-yet-started work is dropped once the pool is cancelled.
        if canceller.is_cancelled() {
            continue;
        }

        let token = canceller.token();
        let outcome = AssertUnwindSafe(async move { job(token).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(MergeError::PoolError(format!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                tracing::debug!(worker, "Task observed pool cancellation");
            }
            Err(err) => record_failure(worker, err, &canceller, &first_error),
        }
    }
}

/// Keep `err` if it is the first failure and cancel the pool.
fn record_failure(
    worker: usize,
    err: MergeError,
    canceller: &Canceller,
    first_error: &Mutex<Option<MergeError>>,
) {
    let mut slot = first_error.lock();
    if slot.is_none() {
        tracing::warn!(worker, error = %err, "Task failed, cancelling pool");
        *slot = Some(err);
    } else {
        tracing::debug!(worker, error = %err, "Discarding secondary task failure");
    }
    canceller.cancel();
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
