//! One unit of pool work: encode a group of rootfses and commit every
//! resulting segment as a layer blob.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use rootmerge_core::config::SplitPolicy;
use rootmerge_core::error::{MergeError, Result};

use super::layer::encode;
use crate::oci::store::{BlobDescriptor, BlobStore};
use crate::pool::CancelToken;

/// A layer committed to the blob store, paired with its diff id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedLayer {
    /// sha256 of the uncompressed tar stream
    pub diff_id: String,
    /// Descriptor of the compressed blob
    pub descriptor: BlobDescriptor,
}

/// A group of rootfses merged into one or more consecutive layers.
#[derive(Debug, Clone)]
pub struct BuildTask {
    /// Position of this group in the build
    pub index: usize,
    /// Rootfs directories, in merge order
    pub rootfses: Vec<PathBuf>,
    /// Compressed size budget per layer (0 = unbounded)
    pub max_layer_size: u64,
    output: Arc<Mutex<Vec<CommittedLayer>>>,
}

impl BuildTask {
    pub fn new(index: usize, rootfses: Vec<PathBuf>, max_layer_size: u64) -> Self {
        Self {
            index,
            rootfses,
            max_layer_size,
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Layers committed so far, in segment order.
    pub fn results(&self) -> Vec<CommittedLayer> {
        self.output.lock().clone()
    }

    /// Encode this group and commit each segment to `store` as it is produced.
    ///
    /// Results are only recorded for segments that were committed in full.
    pub async fn commit_layers(
        &self,
        store: Arc<dyn BlobStore>,
        policy: SplitPolicy,
        cancel: CancelToken,
    ) -> Result<()> {
        tracing::debug!(
            task = self.index,
            rootfses = self.rootfses.len(),
            "Building layer group"
        );

        let (mut handoff, producer) =
            encode(self.rootfses.clone(), self.max_layer_size, policy, cancel);

        let consumed = async {
            while let Some(handle) = handoff.recv().await {
                let (digest, size) = store.put_blob(Box::pin(handle.reader)).await?;
                let diff_id = handle.digester.digest();
                tracing::debug!(
                    task = self.index,
                    segment = handle.index,
                    digest = %digest,
                    size,
                    "Committed layer"
                );
                self.output.lock().push(CommittedLayer {
                    diff_id,
                    descriptor: BlobDescriptor::layer(digest, size),
                });
            }
            Ok::<(), MergeError>(())
        }
        .await;

        // Unblock the producer if we stopped reading early.
        drop(handoff);
        let produced = producer
            .await
            .map_err(|e| MergeError::Other(format!("layer encoder panicked: {}", e)))?;

        match (produced, consumed) {
            (Ok(()), consumed) => consumed,
            (Err(e), Err(consumer_err)) if e.is_broken_pipe() => Err(consumer_err),
            (Err(e), _) => Err(e),
        }
    }
}
