use std::path::PathBuf;

use thiserror::Error;

/// rootmerge error types
#[derive(Error, Debug)]
pub enum MergeError {
    /// Bad command-line input or rootfs list
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The external base-image copy tool failed
    #[error("image import failed: {message}: {output}")]
    ImageImport { message: String, output: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Filesystem walk failed on a specific path
    #[error("Walk error at {path}: {message}")]
    WalkError { path: PathBuf, message: String },

    /// A regular file changed size while it was being archived
    #[error("bad size for {path}: expected {expected} bytes, copied {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The build was aborted because another task failed
    #[error("pool cancelled")]
    Cancelled,

    /// Worker pool misuse
    #[error("Pool error: {0}")]
    PoolError(String),

    /// Blob store I/O or layout error
    #[error("Blob store error: {0}")]
    BlobStoreError(String),

    /// Stored blob content does not hash to its name
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Reference resolution did not yield exactly one manifest
    #[error("bad tag: {0}")]
    InvalidReference(String),

    /// A decoded manifest or config blob had an unexpected shape
    #[error("Manifest shape error: {0}")]
    ManifestShape(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MergeError {
    /// Whether this error only records that the task was cancelled.
    ///
    /// Cancellation is never the root cause of a failed build.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeError::Cancelled)
    }

    /// Whether this error is a broken byte pipe, i.e. the reading side went away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, MergeError::IoError(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        MergeError::SerializationError(err.to_string())
    }
}

/// Result type alias for rootmerge operations
pub type Result<T> = std::result::Result<T, MergeError>;
