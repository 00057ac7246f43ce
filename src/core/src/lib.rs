//! rootmerge Core - Foundational Types
//!
//! This module provides the error type, build configuration and logging
//! options shared by the rootmerge runtime and CLI.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{BuildConfig, SplitPolicy};
pub use error::{MergeError, Result};
pub use log::LogFormat;

/// rootmerge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
