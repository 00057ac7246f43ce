//! OCI image layout support for rootmerge.
//!
//! This module provides the content-addressed blob store the layer
//! pipeline commits into, the base-image importer, and the manifest/config
//! assembly that appends freshly built layers to an existing image.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OCI Image Layout                          │
//! │                                                              │
//! │  oci/                                                        │
//! │  ├── oci-layout           (OCI layout marker)               │
//! │  ├── index.json           (tag → manifest references)       │
//! │  └── blobs/                                                 │
//! │      └── sha256/                                            │
//! │          ├── <manifest>   (Image manifest)                  │
//! │          ├── <config>     (Image configuration)             │
//! │          └── <layers>     (tar+gzip layers)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod build;
pub mod digest;
pub mod import;
pub mod manifest;
pub mod store;

pub use build::{BuildResult, BuildTask, CommittedLayer};
pub use import::import_base_image;
pub use manifest::append_layers;
pub use store::{BlobDescriptor, BlobStore, BlobStream, OciLayout};
