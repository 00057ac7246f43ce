//! Manifest and config assembly.
//!
//! Appends committed layers to the image a tag points at. Both documents
//! are validated against the OCI schema, then edited as raw JSON so fields
//! this crate does not model are written back unchanged.

use oci_spec::image::{ImageConfiguration, ImageManifest, MediaType};
use rootmerge_core::error::{MergeError, Result};
use serde_json::Value;

use super::build::CommittedLayer;
use super::store::{BlobDescriptor, BlobStore};

/// Append `layers` to the image tagged `tag` and move the tag to the new
/// manifest. Returns the new manifest's descriptor.
///
/// Diff ids go to `rootfs.diff_ids` in the config and descriptors to
/// `layers` in the manifest, both in the order given.
pub async fn append_layers(
    store: &dyn BlobStore,
    tag: &str,
    layers: &[CommittedLayer],
) -> Result<BlobDescriptor> {
    let mut refs = store.resolve_reference(tag).await?;
    if refs.len() != 1 {
        return Err(MergeError::InvalidReference(format!(
            "{} resolves to {} manifests, expected exactly 1",
            tag,
            refs.len()
        )));
    }
    let base = refs.remove(0);

    let manifest_bytes = store.read_blob(&base.digest).await?;
    let typed: ImageManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
        MergeError::ManifestShape(format!("manifest {}: {}", base.digest, e))
    })?;
    let mut manifest: Value = serde_json::from_slice(&manifest_bytes)?;

    let config_digest = typed.config().digest().to_string();
    let config_bytes = store.read_blob(&config_digest).await?;
    serde_json::from_slice::<ImageConfiguration>(&config_bytes).map_err(|e| {
        MergeError::ManifestShape(format!("config {}: {}", config_digest, e))
    })?;
    let mut config: Value = serde_json::from_slice(&config_bytes)?;

    config
        .pointer_mut("/rootfs/diff_ids")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| MergeError::ManifestShape("config has no rootfs.diff_ids".to_string()))?
        .extend(layers.iter().map(|l| Value::String(l.diff_id.clone())));

    let descriptors = layers
        .iter()
        .map(|l| serde_json::to_value(&l.descriptor))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    manifest
        .get_mut("layers")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| MergeError::ManifestShape("manifest has no layers".to_string()))?
        .extend(descriptors);

    let (new_config, config_size) = store.put_blob_json(&config).await?;
    let config_desc = manifest
        .get_mut("config")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| MergeError::ManifestShape("manifest has no config".to_string()))?;
    config_desc.insert(
        "mediaType".to_string(),
        Value::String(MediaType::ImageConfig.to_string()),
    );
    config_desc.insert("digest".to_string(), Value::String(new_config.clone()));
    config_desc.insert("size".to_string(), Value::from(config_size));

    let (manifest_digest, manifest_size) = store.put_blob_json(&manifest).await?;
    let mut descriptor = BlobDescriptor::new(MediaType::ImageManifest, manifest_digest, manifest_size);
    descriptor.annotations = base.annotations;

    tracing::info!(
        tag,
        layers = layers.len(),
        config = %new_config,
        manifest = %descriptor.digest,
        "Appended layers to manifest"
    );
    store.update_reference(tag, descriptor.clone()).await?;

    Ok(descriptor)
}
