//! Graph build pipeline.
//!
//! ```text
//! chunks ──▶ ExtractionPool ──mpsc──▶ fold (single writer) ──▶ barrier
//!                                                              │
//!        snapshot ◀── embeddings ◀── reports ◀── communities ◀─┘
//! ```
//!
//! Per-chunk and per-report failures are recorded in the [`BuildManifest`]
//! and never abort the build. Cancellation stops dispatch, drains the
//! in-flight extractions and then fails the build without producing a
//! snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{GraphRagError, Result};
use crate::graphrag::domain::{Chunk, Document, KnowledgeGraph};
use crate::graphrag::embedding::{Embedder, EmbeddingIndex, VectorKind, VectorStoreProvider};
use crate::graphrag::rag::cache::ExtractionCache;
use crate::graphrag::rag::community::{
    CommunityReporter, LeidenCommunityDetector, LeidenConfig, ReportFailure,
};
use crate::graphrag::rag::extraction::{
    EntityExtractor, ExtractionConfig, ExtractionJob, ExtractionPool, LlmEntityExtractor,
};
use crate::graphrag::rag::graph_builder::GraphAccumulator;
use crate::graphrag::snapshot::GraphSnapshot;
use crate::llm::{LanguageModel, ModelBudget};

// =============================================================================
// Manifest
// =============================================================================

/// A unit of work (chunk, document or community) that failed locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub id: String,
    /// Error kind, e.g. `extraction_failed`.
    pub kind: String,
    #[serde(default)]
    pub attempts: u32,
    pub reason: String,
}

impl FailedUnit {
    pub fn from_error(id: impl Into<String>, err: &GraphRagError) -> Self {
        let attempts = match err {
            GraphRagError::ExtractionFailed { attempts, .. } => *attempts,
            _ => 0,
        };
        Self {
            id: id.into(),
            kind: err.kind().to_string(),
            attempts,
            reason: err.to_string(),
        }
    }
}

impl From<ReportFailure> for FailedUnit {
    fn from(f: ReportFailure) -> Self {
        Self {
            id: f.community_id,
            kind: "report_failed".to_string(),
            attempts: f.attempts,
            reason: f.reason,
        }
    }
}

/// Node, edge and community counts of a built graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entities: usize,
    pub relationships: usize,
    pub communities: usize,
    /// Number of hierarchy levels (0 when communities are disabled).
    pub levels: usize,
    pub reports: usize,
}

impl GraphStats {
    pub fn of(graph: &KnowledgeGraph) -> Self {
        Self {
            entities: graph.entities.len(),
            relationships: graph.relationships.len(),
            communities: graph.communities.len(),
            levels: graph.max_level().map_or(0, |l| l as usize + 1),
            reports: graph.reports.len(),
        }
    }
}

/// Outcome record of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub graph_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub force_rebuild: bool,
    pub documents: usize,
    pub chunks: usize,
    /// Chunks whose extraction came from the cache.
    pub cached_chunks: usize,
    pub failed_chunks: Vec<FailedUnit>,
    pub rejected_documents: Vec<FailedUnit>,
    pub failed_reports: Vec<FailedUnit>,
    /// Relationship mentions dropped because an endpoint was not extracted.
    pub unresolved_relationships: usize,
    /// Embedding failures; affected vector tables are empty.
    #[serde(default)]
    pub index_errors: Vec<String>,
    pub stats: GraphStats,
    pub communities_enabled: bool,
    pub seed: Option<u64>,
    pub chunker: String,
    pub embedding_model: String,
}

impl BuildManifest {
    /// Whether any unit of work failed.
    pub fn is_partial(&self) -> bool {
        !self.failed_chunks.is_empty()
            || !self.rejected_documents.is_empty()
            || !self.failed_reports.is_empty()
            || !self.index_errors.is_empty()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Everything one build consumes.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub graph_id: String,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
    pub rejected: Vec<FailedUnit>,
    pub force_rebuild: bool,
}

pub struct GraphPipeline {
    pool: ExtractionPool,
    budget: ModelBudget,
    detector: Option<LeidenCommunityDetector>,
    reporter: CommunityReporter,
    embedder: Arc<dyn Embedder>,
    stores: Arc<dyn VectorStoreProvider>,
    embedding_batch: usize,
    chunker_fingerprint: String,
    seed: Option<u64>,
}

impl std::fmt::Debug for GraphPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphPipeline")
            .field("pool", &self.pool)
            .field("communities", &self.detector.is_some())
            .field("embedder", &self.embedder.model_id())
            .field("chunker", &self.chunker_fingerprint)
            .finish_non_exhaustive()
    }
}

impl GraphPipeline {
    pub fn new(
        config: &AppConfig,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        stores: Arc<dyn VectorStoreProvider>,
        cache: Arc<ExtractionCache>,
        budget: ModelBudget,
        chunker_fingerprint: String,
    ) -> Self {
        let extractor: Arc<dyn EntityExtractor> = Arc::new(LlmEntityExtractor::new(
            Arc::clone(&model),
            ExtractionConfig::from_app(config),
        ));
        let detector = config
            .community
            .enabled
            .then(|| LeidenCommunityDetector::with_config(LeidenConfig::from_app(config)));
        if config.community.enabled && config.community.seed.is_none() {
            warn!("community.seed is unset; community assignment may vary between builds");
        }
        Self {
            pool: ExtractionPool::new(extractor, budget.clone(), cache),
            budget,
            detector,
            reporter: CommunityReporter::new(
                model,
                config.retry_policy(),
                config.community.max_report_input_tokens,
            ),
            embedder,
            stores,
            embedding_batch: config.embedding.batch_size,
            chunker_fingerprint,
            seed: config.community.seed,
        }
    }

    /// Run a full build and return the new snapshot.
    pub async fn build(&self, input: BuildInput, cancel: &CancellationToken) -> Result<GraphSnapshot> {
        let started_at = Utc::now();
        let BuildInput {
            graph_id,
            documents,
            chunks,
            rejected,
            force_rebuild,
        } = input;
        info!(
            graph_id = %graph_id,
            documents = documents.len(),
            chunks = chunks.len(),
            force_rebuild,
            "build.started"
        );

        // Extraction fan-out, single-writer fold.
        let hashes: HashMap<&str, String> = documents
            .iter()
            .map(|d| (d.id.as_str(), d.content_hash()))
            .collect();
        let jobs: Vec<ExtractionJob> = chunks
            .iter()
            .map(|chunk| ExtractionJob {
                cache_key: ExtractionCache::key(
                    hashes.get(chunk.document_id.as_str()).map_or("", String::as_str),
                    &self.chunker_fingerprint,
                    chunk.position,
                ),
                chunk: chunk.clone(),
            })
            .collect();

        let (tx, mut rx) = mpsc::channel(self.budget.concurrency().max(1) * 2);
        let pool = self.pool.clone();
        let pool_cancel = cancel.clone();
        let producer =
            tokio::spawn(async move { pool.run(jobs, force_rebuild, pool_cancel, tx).await });

        let mut accumulator = GraphAccumulator::new();
        let mut cached_chunks = 0;
        let mut failed_chunks = Vec::new();
        while let Some(outcome) = rx.recv().await {
            match outcome.result {
                Ok(extraction) => {
                    if outcome.cached {
                        cached_chunks += 1;
                    }
                    accumulator.fold(&outcome.chunk_id, &extraction.result);
                }
                Err(err) => {
                    warn!(chunk_id = %outcome.chunk_id, error = %err, "Chunk excluded from graph");
                    failed_chunks.push(FailedUnit::from_error(&outcome.chunk_id, &err));
                }
            }
        }
        let dispatched = producer.await.map_err(|e| {
            error!(graph_id = %graph_id, error = %e, "Extraction dispatcher failed");
            GraphRagError::Cancelled(graph_id.clone())
        })?;

        // Barrier: nothing below sees a partial fold.
        if cancel.is_cancelled() {
            info!(graph_id = %graph_id, dispatched, "build.cancelled");
            return Err(GraphRagError::Cancelled(graph_id));
        }
        failed_chunks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut graph = accumulator.finish();
        debug!(
            entities = graph.entities.len(),
            relationships = graph.relationships.len(),
            "Extraction folded"
        );

        let mut failed_reports = Vec::new();
        if let Some(detector) = &self.detector {
            let entities: Vec<_> = graph.entities.values().cloned().collect();
            let relationships: Vec<_> = graph.relationships.values().cloned().collect();
            graph.communities = detector
                .detect_communities(&entities, &relationships)
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();

            let (reports, failures) = self.reporter.generate_all(&graph, &self.budget, cancel).await;
            if cancel.is_cancelled() {
                info!(graph_id = %graph_id, "build.cancelled");
                return Err(GraphRagError::Cancelled(graph_id));
            }
            graph.reports = reports
                .into_iter()
                .map(|r| (r.community_id.clone(), r))
                .collect();
            failed_reports = failures.into_iter().map(FailedUnit::from).collect();
        }
        ensure_consistent(&graph_id, &graph)?;

        let chunk_map: BTreeMap<String, Chunk> =
            chunks.into_iter().map(|c| (c.id.clone(), c)).collect();
        let index = EmbeddingIndex::new(
            Arc::clone(&self.embedder),
            self.stores.create(&graph_id),
            self.embedding_batch,
        );
        let index_errors = embed_graph(&index, &graph, &chunk_map).await;

        let manifest = BuildManifest {
            graph_id: graph_id.clone(),
            started_at,
            completed_at: Utc::now(),
            force_rebuild,
            documents: documents.len(),
            chunks: chunk_map.len(),
            cached_chunks,
            failed_chunks,
            rejected_documents: rejected,
            failed_reports,
            unresolved_relationships: accumulator.unresolved_relationships(),
            index_errors,
            stats: GraphStats::of(&graph),
            communities_enabled: self.detector.is_some(),
            seed: self.seed,
            chunker: self.chunker_fingerprint.clone(),
            embedding_model: self.embedder.model_id().to_string(),
        };
        info!(
            graph_id = %graph_id,
            entities = manifest.stats.entities,
            relationships = manifest.stats.relationships,
            communities = manifest.stats.communities,
            failed_chunks = manifest.failed_chunks.len(),
            partial = manifest.is_partial(),
            "build.completed"
        );

        Ok(GraphSnapshot {
            graph_id,
            graph,
            documents: documents.into_iter().map(|d| (d.id.clone(), d)).collect(),
            chunks: chunk_map,
            index,
            manifest,
        })
    }
}

/// Embed chunks, entity descriptions and report texts. Returns one message
/// per vector table that could not be written.
async fn embed_graph(
    index: &EmbeddingIndex,
    graph: &KnowledgeGraph,
    chunks: &BTreeMap<String, Chunk>,
) -> Vec<String> {
    let tables = [
        (
            VectorKind::Chunk,
            chunks
                .values()
                .map(|c| (c.id.clone(), c.text.clone()))
                .collect::<Vec<_>>(),
        ),
        (
            VectorKind::Entity,
            graph
                .entities
                .values()
                .map(|e| (e.id.clone(), format!("{}: {}", e.name, e.description)))
                .collect(),
        ),
        (
            VectorKind::CommunityReport,
            graph
                .reports
                .values()
                .map(|r| (r.community_id.clone(), r.full_text()))
                .collect(),
        ),
    ];

    let mut errors = Vec::new();
    for (kind, items) in tables {
        if let Err(e) = index.index(kind, items).await {
            warn!(kind = %kind, error = %e, "Embedding failed");
            errors.push(format!("{kind}: {e}"));
        }
    }
    errors
}

/// Refuse to publish a graph that fails its structural checks.
fn ensure_consistent(graph_id: &str, graph: &KnowledgeGraph) -> Result<()> {
    graph.check_invariants().map_err(|violation| {
        error!(graph_id, violation = %violation, "Graph invariant violated");
        GraphRagError::InvariantViolation {
            graph_id: graph_id.to_string(),
            violation,
        }
    })
}
