//! Layer build pipeline.
//!
//! Merges rootfs directories into gzip-compressed tar layers and appends
//! them to an image in an OCI layout.
//!
//! # Usage
//!
//! ```text
//! rootmerge build docker://debian:bookworm rootfses.txt --max-layer-size 104857600
//! ```
//!
//! # Flow
//!
//! ```text
//! rootfs list ─► groups ─► WorkerPool ─┬─► BuildTask 0 ─► segments ─► blobs
//!                                      ├─► BuildTask 1 ─► segments ─► blobs
//!                                      └─► ...
//!                                            │
//!                     manifest + config ◄────┘ (group order)
//! ```

pub mod engine;
pub mod layer;
pub mod pipe;
pub mod task;

pub use engine::{build, build_layers, group_rootfses, read_rootfs_list, BuildResult};
pub use layer::{encode, DiffIdDigester, SegmentHandle};
pub use task::{BuildTask, CommittedLayer};
