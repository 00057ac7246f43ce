use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{MergeError, Result};

/// Default output OCI layout directory.
pub const DEFAULT_OCI_DIR: &str = "oci";

/// Default tag written to the output layout.
pub const DEFAULT_TAG: &str = "rootmerge";

/// Default external tool used to copy the base image into the layout.
pub const DEFAULT_IMPORTER: &str = "skopeo";

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Output OCI layout directory
    pub oci_dir: PathBuf,

    /// Tag (reference name) to read the base manifest from and write the result to
    pub tag: String,

    /// Number of consecutive rootfses merged into one layer group
    pub dirs_per_blob: usize,

    /// Run the groups one at a time instead of in parallel
    pub serialize: bool,

    /// Maximum compressed layer size in bytes (0 = unbounded)
    pub max_layer_size: u64,

    /// Base-image copy tool
    pub importer: String,

    /// Use the existing layout content as the base image
    pub skip_import: bool,

    /// Layer split heuristic tuning
    #[serde(default)]
    pub split: SplitPolicy,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            oci_dir: PathBuf::from(DEFAULT_OCI_DIR),
            tag: DEFAULT_TAG.to_string(),
            dirs_per_blob: 1,
            serialize: false,
            max_layer_size: 0,
            importer: DEFAULT_IMPORTER.to_string(),
            skip_import: false,
            split: SplitPolicy::default(),
        }
    }
}

impl BuildConfig {
    /// Check option combinations that would make the build meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.dirs_per_blob == 0 {
            return Err(MergeError::ConfigError(
                "dirs-per-blob must be at least 1".to_string(),
            ));
        }
        if self.tag.is_empty() {
            return Err(MergeError::ConfigError("tag must not be empty".to_string()));
        }
        self.split.validate()
    }

    /// Number of groups allowed to build at the same time.
    pub fn concurrency(&self) -> usize {
        if self.serialize {
            return 1;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Split heuristic constants.
///
/// A segment is closed before the next entry when
/// `compressed + ratio * (entry_size + overhead_per_entry)` would exceed
/// `max_layer_size * threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    /// Bytes charged per entry for tar header and metadata
    pub overhead_per_entry: u64,

    /// Fraction of the size budget a segment may be projected to reach
    pub threshold: f64,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            overhead_per_entry: 1000,
            threshold: 0.95,
        }
    }
}

impl SplitPolicy {
    fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(MergeError::ConfigError(format!(
                "split threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// Whether adding an entry of `entry_size` bytes would push a segment
    /// over budget, given what has been written to it so far.
    ///
    /// Never splits an empty segment and never splits when `max_size` is 0.
    pub fn should_split(
        &self,
        max_size: u64,
        compressed: u64,
        uncompressed: u64,
        entry_size: u64,
    ) -> bool {
        if max_size == 0 || uncompressed == 0 {
            return false;
        }
        let ratio = compressed as f64 / uncompressed as f64;
        let projected =
            compressed as f64 + ratio * (entry_size as f64 + self.overhead_per_entry as f64);
        projected > max_size as f64 * self.threshold
    }
}
