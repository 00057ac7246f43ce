//! rootmerge Runtime - layer build pipeline.
//!
//! This module merges rootfs directories into new layers of an OCI image:
//! a bounded worker pool runs one task per rootfs group, each task streams
//! its group through a tar+gzip encoder into the content-addressed blob
//! store, and the results are appended to the image manifest and config.

#![allow(clippy::result_large_err)]

pub mod oci;
pub mod pool;

// Re-export common types
pub use oci::build::{build, BuildResult, BuildTask, CommittedLayer};
pub use oci::store::{BlobDescriptor, BlobStore, OciLayout};
pub use pool::{CancelToken, Canceller, WorkerPool};

/// rootmerge runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
