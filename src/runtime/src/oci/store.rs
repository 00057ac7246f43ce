//! Content-addressed blob store backed by an OCI image layout on disk.
//!
//! Blobs live under `blobs/sha256/<hex>` and named references live in
//! `index.json` as manifest descriptors annotated with
//! `org.opencontainers.image.ref.name`. Puts are safe to run concurrently:
//! each one streams into its own temp file and renames it into place.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use oci_spec::image::MediaType;
use rootmerge_core::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use super::digest::{digest_hex, format_digest, is_hex_64};

/// Annotation carrying a reference (tag) name in `index.json`.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Prefix of in-flight blob temp files inside `blobs/sha256`.
const TEMP_PREFIX: &str = ".put-";

/// A stream of byte chunks to be committed as one blob.
pub type BlobStream = Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>>;

/// Descriptor of a stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    /// Media type of the referenced content
    pub media_type: MediaType,
    /// Content digest ("sha256:<hex>")
    pub digest: String,
    /// Size in bytes
    pub size: u64,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl BlobDescriptor {
    /// Create a descriptor without annotations.
    pub fn new(media_type: MediaType, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type,
            digest: digest.into(),
            size,
            annotations: None,
        }
    }

    /// Descriptor for a gzip-compressed tar layer.
    pub fn layer(digest: impl Into<String>, size: u64) -> Self {
        Self::new(MediaType::ImageLayerGzip, digest, size)
    }

    /// The reference name this descriptor is tagged with, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .map(|s| s.as_str())
    }
}

/// Operations the layer pipeline needs from a content-addressed store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Drain `stream` into a new blob. Returns its digest and size.
    async fn put_blob(&self, stream: BlobStream) -> Result<(String, u64)>;

    /// Serialize `value` as JSON and store it as a blob.
    async fn put_blob_json(&self, value: &serde_json::Value) -> Result<(String, u64)> {
        let bytes = serde_json::to_vec(value)?;
        let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(bytes) });
        self.put_blob(Box::pin(stream)).await
    }

    /// Read a whole blob, verifying it against its digest.
    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>>;

    /// All descriptors tagged with `name`.
    async fn resolve_reference(&self, name: &str) -> Result<Vec<BlobDescriptor>>;

    /// Point `name` at `descriptor`, replacing any previous target.
    async fn update_reference(&self, name: &str, descriptor: BlobDescriptor) -> Result<()>;

    /// Delete blobs not reachable from any reference. Returns how many were removed.
    async fn gc(&self) -> Result<usize>;
}

/// The `index.json` document. Unknown fields are carried through untouched.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<BlobDescriptor>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MediaType::ImageIndex.to_string()),
            manifests: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// OCI image layout directory used as a blob store.
pub struct OciLayout {
    /// Root directory of the layout
    root: PathBuf,
    /// Serializes read-modify-write cycles on `index.json`
    index_lock: tokio::sync::Mutex<()>,
}

impl OciLayout {
    /// Open the layout at `root`, creating an empty one if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let blobs_dir = root.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            MergeError::BlobStoreError(format!(
                "Failed to create blobs directory {}: {}",
                blobs_dir.display(),
                e
            ))
        })?;

        let layout_marker = root.join("oci-layout");
        if !layout_marker.exists() {
            std::fs::write(&layout_marker, r#"{"imageLayoutVersion":"1.0.0"}"#).map_err(|e| {
                MergeError::BlobStoreError(format!("Failed to write oci-layout: {}", e))
            })?;
        }

        let layout = Self {
            root,
            index_lock: tokio::sync::Mutex::new(()),
        };
        if !layout.index_path().exists() {
            layout.save_index(&IndexFile::default())?;
        }

        tracing::debug!(root = %layout.root.display(), "Opened OCI layout");
        Ok(layout)
    }

    /// Root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding sha256 blobs.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    /// On-disk path of the blob with `digest`.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir().join(digest_hex(digest)?))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn load_index(&self) -> Result<IndexFile> {
        let path = self.index_path();
        let data = std::fs::read(&path).map_err(|e| {
            MergeError::BlobStoreError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            MergeError::BlobStoreError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn save_index(&self, index: &IndexFile) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&data)?;
        tmp.persist(self.index_path()).map_err(|e| {
            MergeError::BlobStoreError(format!("Failed to write index.json: {}", e))
        })?;
        Ok(())
    }
}

/// Digests reachable from the `roots` manifest descriptors.
///
/// Only manifests and indexes are opened. Config and layer digests are
/// marked reachable without being read, so large layers never enter memory.
fn reachable_blobs(blobs_dir: &Path, roots: Vec<BlobDescriptor>) -> HashSet<String> {
    let mut reachable = HashSet::new();
    let mut pending: Vec<(String, bool)> = roots.into_iter().map(|d| (d.digest, true)).collect();

    while let Some((digest, is_document)) = pending.pop() {
        let Ok(hex_part) = digest_hex(&digest) else {
            continue;
        };
        if !reachable.insert(hex_part.to_string()) || !is_document {
            continue;
        }
        let Ok(data) = std::fs::read(blobs_dir.join(hex_part)) else {
            continue;
        };
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&data) else {
            continue;
        };
        pending.extend(child_digests(&value));
    }

    reachable
}

/// Digests referenced by a manifest or index document, each flagged with
/// whether it is itself a manifest or index.
fn child_digests(value: &serde_json::Value) -> Vec<(String, bool)> {
    let mut out = Vec::new();
    if let Some(digest) = value
        .get("config")
        .and_then(|c| c.get("digest"))
        .and_then(|d| d.as_str())
    {
        out.push((digest.to_string(), false));
    }
    for (key, is_document) in [("layers", false), ("manifests", true)] {
        if let Some(items) = value.get(key).and_then(|v| v.as_array()) {
            out.extend(
                items
                    .iter()
                    .filter_map(|d| d.get("digest").and_then(|d| d.as_str()))
                    .map(|d| (d.to_string(), is_document)),
            );
        }
    }
    out
}

/// Delete every file in `blobs_dir` that is not a reachable blob.
fn sweep_blobs(blobs_dir: &Path, roots: Vec<BlobDescriptor>) -> Result<usize> {
    let reachable = reachable_blobs(blobs_dir, roots);

    let mut removed = 0usize;
    for ent in WalkDir::new(blobs_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !ent.file_type().is_file() {
            continue;
        }
        let name = ent.file_name().to_string_lossy().into_owned();
        if is_hex_64(&name) && reachable.contains(&name) {
            continue;
        }
        std::fs::remove_file(ent.path()).map_err(|e| {
            MergeError::BlobStoreError(format!(
                "Failed to remove unreferenced blob {}: {}",
                ent.path().display(),
                e
            ))
        })?;
        removed += 1;
    }
    Ok(removed)
}

#[async_trait]
impl BlobStore for OciLayout {
    async fn put_blob(&self, mut stream: BlobStream) -> Result<(String, u64)> {
        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.blobs_dir())
            .map_err(|e| {
                MergeError::BlobStoreError(format!("Failed to create blob temp file: {}", e))
            })?;
        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        let digest = format_digest(hasher);
        let dest = self.blob_path(&digest)?;
        if dest.exists() {
            // Identical content already stored; the temp file is removed on drop.
            tracing::debug!(digest = %digest, "Blob already present");
        } else {
            tmp_path.persist(&dest).map_err(|e| {
                MergeError::BlobStoreError(format!(
                    "Failed to move blob into {}: {}",
                    dest.display(),
                    e
                ))
            })?;
        }

        tracing::debug!(digest = %digest, size, "Stored blob");
        Ok((digest, size))
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        let data = tokio::fs::read(&path).await.map_err(|e| {
            MergeError::BlobStoreError(format!("Failed to read blob {}: {}", digest, e))
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let actual = format_digest(hasher);
        if actual != digest {
            return Err(MergeError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    async fn resolve_reference(&self, name: &str) -> Result<Vec<BlobDescriptor>> {
        let _guard = self.index_lock.lock().await;
        let index = self.load_index()?;
        Ok(index
            .manifests
            .into_iter()
            .filter(|d| d.ref_name() == Some(name))
            .collect())
    }

    async fn update_reference(&self, name: &str, descriptor: BlobDescriptor) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index()?;
        index.manifests.retain(|d| d.ref_name() != Some(name));

        let mut descriptor = descriptor;
        descriptor
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
        tracing::info!(reference = name, digest = %descriptor.digest, "Updated reference");
        index.manifests.push(descriptor);

        self.save_index(&index)
    }

    async fn gc(&self) -> Result<usize> {
        let _guard = self.index_lock.lock().await;
        let roots = self.load_index()?.manifests;
        let blobs_dir = self.blobs_dir();

        let removed = tokio::task::spawn_blocking(move || sweep_blobs(&blobs_dir, roots))
            .await
            .map_err(|e| MergeError::BlobStoreError(format!("GC task failed: {}", e)))??;

        tracing::debug!(removed, "Garbage collected OCI layout");
        Ok(removed)
    }
}
