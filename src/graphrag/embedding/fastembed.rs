//! Local ONNX embeddings via `fastembed`.

use std::sync::Arc;

use ::fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{Embedder, EmbeddingError};

/// Lazily loaded `fastembed` model. Inference runs on the blocking pool.
pub struct FastEmbedder {
    model_name: String,
    model_kind: EmbeddingModel,
    batch_size: usize,
    model: Arc<Mutex<Option<TextEmbedding>>>,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model", &self.model_name)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl FastEmbedder {
    pub fn new(model_name: &str, batch_size: usize) -> Result<Self, EmbeddingError> {
        let model_kind = match model_name {
            "BAAI/bge-small-en-v1.5" | "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "BAAI/bge-base-en-v1.5" | "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            "BAAI/bge-large-en-v1.5" | "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
            "sentence-transformers/all-MiniLM-L6-v2" | "all-MiniLM-L6-v2" => {
                EmbeddingModel::AllMiniLML6V2
            }
            other => return Err(EmbeddingError::UnknownModel(other.to_string())),
        };
        Ok(Self {
            model_name: model_name.to_string(),
            model_kind,
            batch_size: batch_size.max(1),
            model: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.model.lock().await;
        let mut model = match guard.take() {
            Some(model) => model,
            None => {
                info!(model = %self.model_name, "Initializing fastembed model");
                let options = InitOptions::new(self.model_kind.clone());
                tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await
                    .map_err(|e| EmbeddingError::Load(e.to_string()))?
                    .map_err(|e| EmbeddingError::Load(e.to_string()))?
            }
        };

        let batch_size = self.batch_size;
        let (result, model) = tokio::task::spawn_blocking(move || {
            let result = model.embed(texts, Some(batch_size));
            (result, model)
        })
        .await
        .map_err(|e| EmbeddingError::Embed(e.to_string()))?;

        *guard = Some(model);
        result.map_err(|e| EmbeddingError::Embed(e.to_string()))
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_mapping() {
        assert!(FastEmbedder::new("BAAI/bge-small-en-v1.5", 32).is_ok());
        assert!(matches!(
            FastEmbedder::new("made-up-model", 32),
            Err(EmbeddingError::UnknownModel(_))
        ));
    }
}
