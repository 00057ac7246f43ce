//! Bounded worker pool for layer build tasks.
//!
//! Tasks are submitted, the submission list is sealed, and `run()` drains
//! them across a fixed number of workers. The first genuine failure trips
//! a shared cancel token that every task observes cooperatively.

pub mod worker_pool;

pub use worker_pool::{CancelToken, Canceller, WorkerPool};
