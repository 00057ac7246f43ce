//! Base image import through an external copy tool.

use std::path::Path;

use rootmerge_core::error::{MergeError, Result};
use tokio::process::Command;

/// Copy `base_image` into the OCI layout at `oci_dir` under `tag`.
///
/// Runs `<importer> --insecure-policy copy --src-tls-verify=false
/// <base_image> oci:<oci_dir>:<tag>`. A non-zero exit carries the tool's
/// combined output in the error.
pub async fn import_base_image(
    importer: &str,
    base_image: &str,
    oci_dir: &Path,
    tag: &str,
) -> Result<()> {
    let destination = format!("oci:{}:{}", oci_dir.display(), tag);
    tracing::info!(base_image, destination = %destination, "Importing base image");

    let output = Command::new(importer)
        .arg("--insecure-policy")
        .arg("copy")
        .arg("--src-tls-verify=false")
        .arg(base_image)
        .arg(&destination)
        .output()
        .await
        .map_err(|e| MergeError::ImageImport {
            message: format!("failed to run {}", importer),
            output: e.to_string(),
        })?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(MergeError::ImageImport {
            message: output.status.to_string(),
            output: combined.trim().to_string(),
        });
    }

    tracing::debug!(base_image, "Base image imported");
    Ok(())
}
