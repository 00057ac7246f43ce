//! Bounded in-memory byte pipe between the blocking archive writer and the
//! async blob commit.
//!
//! The writer half implements [`std::io::Write`] and blocks when the reader
//! falls `PIPE_DEPTH` chunks behind. The reader half is a
//! [`ReceiverStream`] of chunks, so it can be handed straight to
//! [`BlobStore::put_blob`](crate::oci::store::BlobStore::put_blob).

use std::io;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Number of chunks buffered before the writer blocks.
pub const PIPE_DEPTH: usize = 16;

type Chunk = io::Result<Vec<u8>>;

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    (PipeWriter { tx: Some(tx) }, ReceiverStream::new(rx))
}

/// Blocking write side. Must not be used from inside an async context.
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<mpsc::Sender<Chunk>>,
}

impl PipeWriter {
    /// Close the pipe; the reader sees end-of-stream after draining.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Close the pipe so that the reader yields `err` instead of a clean end.
    pub fn close_with_error(&mut self, err: io::Error) {
        if let Some(tx) = self.tx.take() {
            // Reader already gone: nobody left to tell.
            let _ = tx.blocking_send(Err(err));
        }
    }
}

fn reader_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "segment reader went away")
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self.tx.as_ref().ok_or_else(reader_gone)?;
        tx.blocking_send(Ok(buf.to_vec()))
            .map_err(|_| reader_gone())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Async read side.
pub type PipeReader = ReceiverStream<Chunk>;
