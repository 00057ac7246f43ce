//! SHA-256 content digests in OCI `sha256:<hex>` form.

use rootmerge_core::error::{MergeError, Result};
use sha2::{Digest, Sha256};

/// Algorithm prefix for every digest rootmerge produces.
pub const SHA256_PREFIX: &str = "sha256:";

/// Compute the prefixed SHA-256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format_digest(hasher)
}

/// Finalize a hasher into a prefixed digest string.
pub fn format_digest(hasher: Sha256) -> String {
    format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize()))
}

/// Split a `sha256:<hex>` digest and return the validated hex part.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex_part = digest.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
        MergeError::BlobStoreError(format!("unsupported digest algorithm: {}", digest))
    })?;
    if !is_hex_64(hex_part) {
        return Err(MergeError::BlobStoreError(format!(
            "malformed digest: {}",
            digest
        )));
    }
    Ok(hex_part)
}

/// Whether `s` looks like a lowercase SHA-256 hex string.
pub fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
