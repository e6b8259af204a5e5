//! Per-chunk extraction cache.
//!
//! Keyed by (document content hash, chunker fingerprint, chunk position) so a
//! rebuild without `force_rebuild` skips model calls for unchanged chunks.
//! Only successful extractions are cached; failed chunks are retried on the
//! next build.

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::warn;

use crate::graphrag::domain::ExtractionResult;

#[derive(Debug, Default)]
pub struct ExtractionCache {
    dir: Option<PathBuf>,
    memory: RwLock<HashMap<String, ExtractionResult>>,
}

impl ExtractionCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Cache that also reads and writes `<dir>/<key>.json`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            memory: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(document_hash: &str, chunker_fingerprint: &str, position: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_hash.as_bytes());
        hasher.update(b"\0");
        hasher.update(chunker_fingerprint.as_bytes());
        hasher.update(b"\0");
        hasher.update(position.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<ExtractionResult> {
        if let Some(hit) = self.memory.read().await.get(key) {
            return Some(hit.clone());
        }
        let path = self.dir.as_ref()?.join(format!("{key}.json"));
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<ExtractionResult>(&bytes) {
            Ok(result) => {
                self.memory
                    .write()
                    .await
                    .insert(key.to_string(), result.clone());
                Some(result)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt cache entry");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, result: &ExtractionResult) {
        self.memory
            .write()
            .await
            .insert(key.to_string(), result.clone());

        let Some(dir) = &self.dir else {
            return;
        };
        let write = async {
            tokio::fs::create_dir_all(dir).await?;
            let bytes = serde_json::to_vec(result)?;
            tokio::fs::write(dir.join(format!("{key}.json")), bytes).await?;
            Ok::<_, crate::error::GraphRagError>(())
        };
        if let Err(e) = write.await {
            warn!(key, error = %e, "Failed to persist extraction cache entry");
        }
    }

    pub async fn len(&self) -> usize {
        self.memory.read().await.len()
    }
}
