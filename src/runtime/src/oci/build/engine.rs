//! Build engine for merging rootfs directories into an OCI image.
//!
//! Imports the base image, groups the rootfses, runs one pool task per
//! group to encode and commit layers, then appends every committed layer to
//! the tagged manifest in group order. Unreferenced blobs are collected on
//! the way out, whether or not the build succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rootmerge_core::config::{BuildConfig, SplitPolicy};
use rootmerge_core::error::{MergeError, Result};

use super::task::{BuildTask, CommittedLayer};
use crate::oci::import::import_base_image;
use crate::oci::manifest::append_layers;
use crate::oci::store::{BlobDescriptor, BlobStore, OciLayout};
use crate::pool::WorkerPool;

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Descriptor of the rewritten manifest
    pub manifest: BlobDescriptor,
    /// Number of layers appended to the base image
    pub layers_added: usize,
    /// Diff ids of the appended layers, in manifest order
    pub diff_ids: Vec<String>,
    /// Total compressed size of the appended layers
    pub layers_size: u64,
}

impl BuildResult {
    /// Digest of the rewritten manifest.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest.digest
    }
}

/// Read a newline-separated rootfs list, resolving relative paths against
/// the current directory.
pub fn read_rootfs_list(path: &Path) -> Result<Vec<PathBuf>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MergeError::InvalidInput(format!(
            "Failed to read rootfs list {}: {}",
            path.display(),
            e
        ))
    })?;

    let cwd = std::env::current_dir()?;
    let rootfses: Vec<PathBuf> = content
        .trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| cwd.join(line))
        .collect();

    if rootfses.is_empty() {
        return Err(MergeError::InvalidInput(format!(
            "rootfs list {} is empty",
            path.display()
        )));
    }
    Ok(rootfses)
}

/// Split `rootfses` into consecutive groups of `dirs_per_blob`.
pub fn group_rootfses(
    rootfses: Vec<PathBuf>,
    dirs_per_blob: usize,
    max_layer_size: u64,
) -> Result<Vec<BuildTask>> {
    if dirs_per_blob == 0 {
        return Err(MergeError::ConfigError(
            "dirs-per-blob must be at least 1".to_string(),
        ));
    }
    Ok(rootfses
        .chunks(dirs_per_blob)
        .enumerate()
        .map(|(index, group)| BuildTask::new(index, group.to_vec(), max_layer_size))
        .collect())
}

/// Run every task on a worker pool of `concurrency` workers.
///
/// Returns the first failure; the others are cancelled.
pub async fn run_tasks(
    tasks: &[BuildTask],
    store: Arc<dyn BlobStore>,
    concurrency: usize,
    policy: SplitPolicy,
) -> Result<()> {
    let pool = WorkerPool::new(concurrency);
    for task in tasks {
        let task = task.clone();
        let store = Arc::clone(&store);
        pool.add(move |cancel| async move { task.commit_layers(store, policy, cancel).await })?;
    }
    pool.done_adding_jobs();
    pool.run().await
}

/// Build layers for `rootfses` into `store` and append them to the manifest
/// tagged `config.tag`.
///
/// The manifest is only touched once every group has been committed.
pub async fn build_layers(
    config: &BuildConfig,
    store: Arc<dyn BlobStore>,
    rootfses: Vec<PathBuf>,
) -> Result<BuildResult> {
    config.validate()?;
    let tasks = group_rootfses(rootfses, config.dirs_per_blob, config.max_layer_size)?;
    let concurrency = config.concurrency();

    tracing::info!(
        groups = tasks.len(),
        concurrency,
        max_layer_size = config.max_layer_size,
        "Building layers"
    );
    run_tasks(&tasks, Arc::clone(&store), concurrency, config.split).await?;

    let layers: Vec<CommittedLayer> = tasks.iter().flat_map(|t| t.results()).collect();
    let manifest = append_layers(store.as_ref(), &config.tag, &layers).await?;

    let layers_size = layers.iter().map(|l| l.descriptor.size).sum();
    tracing::info!(
        tag = %config.tag,
        manifest = %manifest.digest,
        layers = layers.len(),
        size = %format_size(layers_size),
        "Build complete"
    );

    Ok(BuildResult {
        manifest,
        layers_added: layers.len(),
        diff_ids: layers.into_iter().map(|l| l.diff_id).collect(),
        layers_size,
    })
}

/// Import `base_image` into `config.oci_dir` and merge `rootfses` on top.
///
/// Garbage collection runs after the layer build regardless of outcome;
/// its failure is logged and never replaces the build's own result.
pub async fn build(
    config: &BuildConfig,
    base_image: &str,
    rootfses: Vec<PathBuf>,
) -> Result<BuildResult> {
    config.validate()?;
    if rootfses.is_empty() {
        return Err(MergeError::InvalidInput("no rootfs given".to_string()));
    }

    if config.skip_import {
        tracing::info!(oci_dir = %config.oci_dir.display(), "Using existing layout as base");
    } else {
        import_base_image(&config.importer, base_image, &config.oci_dir, &config.tag).await?;
    }

    let store: Arc<dyn BlobStore> = Arc::new(OciLayout::open(&config.oci_dir)?);
    let result = build_layers(config, Arc::clone(&store), rootfses).await;

    match store.gc().await {
        Ok(removed) => tracing::debug!(removed, "Removed unreferenced blobs"),
        Err(e) => tracing::warn!(error = %e, "Garbage collection failed"),
    }

    result
}

/// Format a byte size as a human-readable string.
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
