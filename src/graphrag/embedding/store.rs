//! Vector tables keyed by record id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{IndexError, cosine_similarity};

/// Which vector table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorKind {
    Chunk,
    Entity,
    CommunityReport,
}

impl VectorKind {
    pub const ALL: [VectorKind; 3] = [Self::Chunk, Self::Entity, Self::CommunityReport];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Entity => "entity",
            Self::CommunityReport => "community_report",
        }
    }
}

impl std::fmt::Display for VectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

/// Pluggable vector backend.
#[async_trait]
pub trait VectorStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace vectors by id.
    async fn upsert(&self, kind: VectorKind, records: Vec<(String, Vec<f32>)>)
    -> Result<(), IndexError>;

    /// Top `k` ids by cosine similarity, best first. An empty table yields
    /// an empty result.
    async fn search(&self, kind: VectorKind, query: &[f32], k: usize)
    -> Result<Vec<ScoredId>, IndexError>;

    /// All vectors of a table in id order.
    async fn entries(&self, kind: VectorKind) -> Result<Vec<(String, Vec<f32>)>, IndexError>;

    /// Look up one vector.
    async fn get(&self, kind: VectorKind, id: &str) -> Result<Option<Vec<f32>>, IndexError>;

    async fn len(&self, kind: VectorKind) -> Result<usize, IndexError>;
}

/// Creates an empty store for each new graph snapshot.
pub trait VectorStoreProvider: Send + Sync + std::fmt::Debug {
    fn create(&self, graph_id: &str) -> Arc<dyn VectorStore>;
}

#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    tables: RwLock<HashMap<VectorKind, BTreeMap<String, Vec<f32>>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        kind: VectorKind,
        records: Vec<(String, Vec<f32>)>,
    ) -> Result<(), IndexError> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(kind).or_default();
        // The whole batch is checked before any row is written.
        let expected = table
            .values()
            .next()
            .or_else(|| records.first().map(|(_, v)| v))
            .map(Vec::len);
        if let Some(expected) = expected {
            if let Some((_, bad)) = records.iter().find(|(_, v)| v.len() != expected) {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }
        table.extend(records);
        Ok(())
    }

    async fn search(
        &self,
        kind: VectorKind,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredId>, IndexError> {
        let tables = self.tables.read().await;
        let Some(table) = tables.get(&kind) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ScoredId> = table
            .iter()
            .map(|(id, v)| ScoredId {
                id: id.clone(),
                score: cosine_similarity(query, v),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn entries(&self, kind: VectorKind) -> Result<Vec<(String, Vec<f32>)>, IndexError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&kind)
            .map(|t| t.iter().map(|(id, v)| (id.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn get(&self, kind: VectorKind, id: &str) -> Result<Option<Vec<f32>>, IndexError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&kind)
            .and_then(|t| t.get(id).cloned()))
    }

    async fn len(&self, kind: VectorKind) -> Result<usize, IndexError> {
        Ok(self.tables.read().await.get(&kind).map_or(0, BTreeMap::len))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryVectorStoreProvider;

impl VectorStoreProvider for InMemoryVectorStoreProvider {
    fn create(&self, _graph_id: &str) -> Arc<dyn VectorStore> {
        Arc::new(InMemoryVectorStore::new())
    }
}
