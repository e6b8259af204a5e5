//! Tabular archive layout: one JSON-lines file per record table keyed by id,
//! plus one vector table per embedding kind.
//!
//! ```text
//! <dir>/manifest.json
//! <dir>/documents.jsonl           <dir>/text_units.jsonl
//! <dir>/entities.jsonl            <dir>/relationships.jsonl
//! <dir>/communities.jsonl         <dir>/community_reports.jsonl
//! <dir>/embeddings_chunk.jsonl    <dir>/embeddings_entity.jsonl
//! <dir>/embeddings_community_report.jsonl
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GraphRagError, Result};
use crate::graphrag::domain::{
    Chunk, Community, CommunityReport, Document, Entity, KnowledgeGraph, Relationship,
};
use crate::graphrag::embedding::{Embedder, EmbeddingIndex, VectorKind, VectorStore};
use crate::graphrag::rag::BuildManifest;
use crate::graphrag::snapshot::GraphSnapshot;

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST: &str = "manifest.json";
const DOCUMENTS: &str = "documents.jsonl";
const TEXT_UNITS: &str = "text_units.jsonl";
const ENTITIES: &str = "entities.jsonl";
const RELATIONSHIPS: &str = "relationships.jsonl";
const COMMUNITIES: &str = "communities.jsonl";
const REPORTS: &str = "community_reports.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub archived_at: DateTime<Utc>,
    pub build: BuildManifest,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorRow {
    id: String,
    vector: Vec<f32>,
}

fn embeddings_file(kind: VectorKind) -> String {
    format!("embeddings_{}.jsonl", kind.as_str())
}

async fn write_lines<'a, T, I>(dir: &Path, name: &str, rows: I) -> Result<usize>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut out = String::new();
    let mut count = 0;
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
        count += 1;
    }
    tokio::fs::write(dir.join(name), out).await?;
    Ok(count)
}

async fn read_lines<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Vec<T>> {
    let path = dir.join(name);
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| GraphRagError::Archive(format!("{}: {e}", path.display())))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| GraphRagError::Archive(format!("{name} line {}: {e}", n + 1)))
        })
        .collect()
}

/// Write a snapshot to `dir`, creating it if needed.
pub async fn write_archive(snapshot: &GraphSnapshot, dir: &Path) -> Result<ArchiveManifest> {
    tokio::fs::create_dir_all(dir).await?;
    let graph = &snapshot.graph;

    write_lines(dir, DOCUMENTS, snapshot.documents.values()).await?;
    write_lines(dir, TEXT_UNITS, snapshot.chunks.values()).await?;
    write_lines(dir, ENTITIES, graph.entities.values()).await?;
    write_lines(dir, RELATIONSHIPS, graph.relationships.values()).await?;
    write_lines(dir, COMMUNITIES, graph.communities.values()).await?;
    write_lines(dir, REPORTS, graph.reports.values()).await?;

    for kind in VectorKind::ALL {
        let rows: Vec<VectorRow> = snapshot
            .index
            .store()
            .entries(kind)
            .await
            .map_err(|e| GraphRagError::Archive(e.to_string()))?
            .into_iter()
            .map(|(id, vector)| VectorRow { id, vector })
            .collect();
        write_lines(dir, &embeddings_file(kind), &rows).await?;
    }

    let manifest = ArchiveManifest {
        format_version: FORMAT_VERSION,
        archived_at: Utc::now(),
        build: snapshot.manifest.clone(),
    };
    tokio::fs::write(dir.join(MANIFEST), serde_json::to_vec_pretty(&manifest)?).await?;
    info!(
        graph_id = %snapshot.graph_id,
        dir = %dir.display(),
        entities = graph.entities.len(),
        "archive.written"
    );
    Ok(manifest)
}

fn keyed<T>(rows: Vec<T>, id: impl Fn(&T) -> String) -> BTreeMap<String, T> {
    rows.into_iter().map(|r| (id(&r), r)).collect()
}

/// Load an archive into a new snapshot backed by `store`.
pub async fn read_archive(
    graph_id: &str,
    dir: &Path,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    batch_size: usize,
) -> Result<GraphSnapshot> {
    let manifest_path = dir.join(MANIFEST);
    let raw = tokio::fs::read(&manifest_path)
        .await
        .map_err(|e| GraphRagError::Archive(format!("{}: {e}", manifest_path.display())))?;
    let manifest: ArchiveManifest = serde_json::from_slice(&raw)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(GraphRagError::Archive(format!(
            "unsupported archive format version {}",
            manifest.format_version
        )));
    }
    if manifest.build.embedding_model != embedder.model_id() {
        warn!(
            archived = %manifest.build.embedding_model,
            current = %embedder.model_id(),
            "Archive was embedded with a different model"
        );
    }

    let graph = KnowledgeGraph {
        entities: keyed(read_lines(dir, ENTITIES).await?, |e: &Entity| e.id.clone()),
        relationships: keyed(read_lines(dir, RELATIONSHIPS).await?, |r: &Relationship| r.id.clone()),
        communities: keyed(read_lines(dir, COMMUNITIES).await?, |c: &Community| c.id.clone()),
        reports: keyed(read_lines(dir, REPORTS).await?, |r: &CommunityReport| {
            r.community_id.clone()
        }),
    };
    graph.check_invariants().map_err(GraphRagError::Archive)?;

    for kind in VectorKind::ALL {
        let rows: Vec<VectorRow> = read_lines(dir, &embeddings_file(kind)).await?;
        if rows.is_empty() {
            continue;
        }
        store
            .upsert(kind, rows.into_iter().map(|r| (r.id, r.vector)).collect())
            .await
            .map_err(|e| GraphRagError::Archive(e.to_string()))?;
    }

    let snapshot = GraphSnapshot {
        graph_id: graph_id.to_string(),
        graph,
        documents: keyed(read_lines(dir, DOCUMENTS).await?, |d: &Document| d.id.clone()),
        chunks: keyed(read_lines(dir, TEXT_UNITS).await?, |c: &Chunk| c.id.clone()),
        index: EmbeddingIndex::new(embedder, store, batch_size),
        manifest: manifest.build,
    };
    info!(graph_id, dir = %dir.display(), "archive.restored");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphrag::embedding::{EmbeddingError, InMemoryVectorStore};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Unused;

    #[async_trait]
    impl Embedder for Unused {
        async fn embed(&self, _texts: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Embed("not expected".into()))
        }

        fn model_id(&self) -> &str {
            "unused"
        }
    }

    async fn open(dir: &Path) -> Result<GraphSnapshot> {
        read_archive("g", dir, Arc::new(Unused), Arc::new(InMemoryVectorStore::new()), 8).await
    }

    fn manifest_json(version: u32) -> String {
        serde_json::json!({
            "format_version": version,
            "archived_at": "2024-01-01T00:00:00Z",
            "build": {
                "graph_id": "g",
                "started_at": "2024-01-01T00:00:00Z",
                "completed_at": "2024-01-01T00:00:00Z",
                "force_rebuild": false,
                "documents": 0,
                "chunks": 0,
                "cached_chunks": 0,
                "failed_chunks": [],
                "rejected_documents": [],
                "failed_reports": [],
                "unresolved_relationships": 0,
                "stats": {"entities": 0, "relationships": 0, "communities": 0, "levels": 0, "reports": 0},
                "communities_enabled": true,
                "seed": 1,
                "chunker": "sentences",
                "embedding_model": "unused"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(&dir.path().join("absent")).await.unwrap_err();
        assert_eq!(err.kind(), "archive");
    }

    #[tokio::test]
    async fn test_unknown_format_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST), manifest_json(99)).unwrap();
        let err = open(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("format version 99"));
    }

    #[tokio::test]
    async fn test_corrupt_table_names_the_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST), manifest_json(FORMAT_VERSION)).unwrap();
        std::fs::write(dir.path().join(ENTITIES), "\n{not json\n").unwrap();
        let err = open(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), "archive");
        assert!(err.to_string().contains("entities.jsonl line 2"));
    }
}
