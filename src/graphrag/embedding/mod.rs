//! Embedding Index
//!
//! Vectors for chunks, entity descriptions and community reports, searched by
//! cosine similarity. The [`Embedder`] turns text into vectors; a
//! [`VectorStore`] keeps them per [`VectorKind`]. [`EmbeddingIndex`] glues
//! the two and maps backend failures to `IndexUnavailable`.

pub mod fastembed;
pub mod store;

pub use self::fastembed::FastEmbedder;
pub use store::{
    InMemoryVectorStore, InMemoryVectorStoreProvider, ScoredId, VectorKind, VectorStore,
    VectorStoreProvider,
};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::GraphRagError;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Unknown embedding model: {0}")]
    UnknownModel(String),
    #[error("Embedding model failed to load: {0}")]
    Load(String),
    #[error("Embedding failed: {0}")]
    Embed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Vector store backend error: {0}")]
    Backend(String),
}

/// Turns text into dense vectors.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn model_id(&self) -> &str;
}

/// Embedder plus vector store for one graph snapshot.
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    batch_size: usize,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, batch_size: usize) -> Self {
        Self {
            embedder,
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Embed `(id, text)` pairs and replace their vectors.
    pub async fn index(
        &self,
        kind: VectorKind,
        items: Vec<(String, String)>,
    ) -> Result<usize, GraphRagError> {
        let mut written = 0;
        for batch in items.chunks(self.batch_size) {
            let texts = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self
                .embedder
                .embed(texts)
                .await
                .map_err(|e| GraphRagError::IndexUnavailable(e.to_string()))?;
            if vectors.len() != batch.len() {
                return Err(GraphRagError::IndexUnavailable(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            let records = batch
                .iter()
                .map(|(id, _)| id.clone())
                .zip(vectors)
                .collect::<Vec<_>>();
            written += records.len();
            self.store
                .upsert(kind, records)
                .await
                .map_err(|e| GraphRagError::IndexUnavailable(e.to_string()))?;
        }
        debug!(kind = %kind, written, "Indexed vectors");
        Ok(written)
    }

    /// Embed a query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GraphRagError> {
        self.embedder
            .embed(vec![text.to_string()])
            .await
            .map_err(|e| GraphRagError::IndexUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphRagError::IndexUnavailable("embedder returned no vector".into()))
    }

    /// Nearest neighbours of an already embedded query.
    pub async fn search(
        &self,
        kind: VectorKind,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredId>, GraphRagError> {
        self.store
            .search(kind, query, k)
            .await
            .map_err(|e| GraphRagError::IndexUnavailable(e.to_string()))
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
