//! Entry points: index, build, query, fetch, archive and restore.
//!
//! Each graph id owns its ingested corpus and the last completed snapshot.
//! Builds for one graph are serialised by a mutex and publish a new snapshot
//! only on success; queries clone the current snapshot `Arc` and never wait
//! for a build.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{GraphRagError, Result};
use crate::graphrag::domain::{
    Chunk, Community, CommunityReport, Document, Entity, QueryRequest, QueryResult,
};
use crate::graphrag::embedding::{Embedder, VectorStoreProvider};
use crate::graphrag::persistence::{ArchiveManifest, read_archive, write_archive};
use crate::graphrag::rag::{BuildInput, Chunker, ExtractionCache, FailedUnit, GraphPipeline};
use crate::graphrag::retrieval::{QueryRouter, SearchContext};
use crate::graphrag::snapshot::GraphSnapshot;
use crate::llm::{LanguageModel, ModelBudget, RetryPolicy};

pub use crate::graphrag::rag::{BuildManifest, GraphStats};

// =============================================================================
// Handles
// =============================================================================

/// Lifecycle of an indexing or build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// What an indexing job did with each document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexingReport {
    pub graph_id: String,
    /// Newly ingested document ids.
    pub accepted: Vec<String>,
    /// Ids already ingested with identical content.
    pub unchanged: Vec<String>,
    pub rejected: Vec<FailedUnit>,
    /// Chunks created by this job.
    pub chunks: usize,
}

#[derive(Debug)]
pub struct IndexingHandle {
    graph_id: String,
    status: watch::Receiver<JobStatus>,
    task: JoinHandle<Result<IndexingReport>>,
}

impl IndexingHandle {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Wait until the job ends. A batch in which every document was
    /// rejected ends as `Failed`; its report still lists the rejections.
    pub async fn finished(&mut self) -> JobStatus {
        let _ = self.status.wait_for(|s| s.is_finished()).await;
        *self.status.borrow()
    }

    pub async fn wait(self) -> Result<IndexingReport> {
        join(&self.graph_id, self.task).await
    }
}

#[derive(Debug)]
pub struct BuildHandle {
    graph_id: String,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
    task: JoinHandle<Result<BuildManifest>>,
}

impl BuildHandle {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Stop dispatching new work. In-flight model calls finish and the
    /// previous snapshot stays in place.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the status changes away from `Pending`/`Running`.
    pub async fn finished(&mut self) -> JobStatus {
        let _ = self.status.wait_for(|s| s.is_finished()).await;
        *self.status.borrow()
    }

    pub async fn wait(self) -> Result<BuildManifest> {
        join(&self.graph_id, self.task).await
    }
}

async fn join<T>(graph_id: &str, task: JoinHandle<Result<T>>) -> Result<T> {
    task.await.map_err(|e| {
        error!(graph_id, error = %e, "Job task aborted");
        GraphRagError::Cancelled(graph_id.to_string())
    })?
}

/// Result of a direct node lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphNode {
    Entity(Entity),
    Community {
        community: Community,
        report: Option<CommunityReport>,
    },
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Default)]
struct Corpus {
    documents: BTreeMap<String, Document>,
    chunks: BTreeMap<String, Vec<Chunk>>,
    rejected: BTreeMap<String, FailedUnit>,
}

#[derive(Debug, Default)]
struct GraphState {
    corpus: Mutex<Corpus>,
    snapshot: RwLock<Option<Arc<GraphSnapshot>>>,
    build_lock: Mutex<()>,
}

struct ServiceInner {
    config: AppConfig,
    chunker: Chunker,
    pipeline: GraphPipeline,
    router: QueryRouter,
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    stores: Arc<dyn VectorStoreProvider>,
    query_budget: ModelBudget,
    query_retry: RetryPolicy,
    graphs: RwLock<HashMap<String, Arc<GraphState>>>,
}

/// Graph ingestion and question answering over many graph ids.
#[derive(Clone)]
pub struct GraphRagService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for GraphRagService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRagService")
            .field("model", &self.inner.model.model_id())
            .field("embedder", &self.inner.embedder.model_id())
            .field("chunker", &self.inner.chunker.fingerprint())
            .finish_non_exhaustive()
    }
}

impl GraphRagService {
    pub fn new(
        config: AppConfig,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        stores: Arc<dyn VectorStoreProvider>,
    ) -> Result<Self> {
        let chunker =
            Chunker::new(config.chunking.clone()).map_err(|e| GraphRagError::Config(e.to_string()))?;
        let cache = Arc::new(match &config.storage.cache_dir {
            Some(dir) => ExtractionCache::persistent(dir),
            None => ExtractionCache::in_memory(),
        });
        let budget = ModelBudget::new(
            config.extraction.concurrency,
            config.extraction.requests_per_second,
        );
        let pipeline = GraphPipeline::new(
            &config,
            Arc::clone(&model),
            Arc::clone(&embedder),
            Arc::clone(&stores),
            cache,
            budget,
            chunker.fingerprint(),
        );
        // Query calls do not share permits with builds.
        let query_budget = ModelBudget::new(
            config.extraction.concurrency,
            config.extraction.requests_per_second,
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                router: QueryRouter::new(config.query.clone()),
                query_retry: config.retry_policy(),
                config,
                chunker,
                pipeline,
                model,
                embedder,
                stores,
                query_budget,
                graphs: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    async fn state(&self, graph_id: &str) -> Arc<GraphState> {
        if let Some(state) = self.inner.graphs.read().await.get(graph_id) {
            return Arc::clone(state);
        }
        let mut graphs = self.inner.graphs.write().await;
        Arc::clone(graphs.entry(graph_id.to_string()).or_default())
    }

    /// The last completed build of `graph_id`.
    pub async fn snapshot(&self, graph_id: &str) -> Result<Arc<GraphSnapshot>> {
        let state = self.inner.graphs.read().await.get(graph_id).cloned();
        match state {
            Some(state) => state
                .snapshot
                .read()
                .await
                .clone()
                .ok_or_else(|| GraphRagError::GraphNotBuilt(graph_id.to_string())),
            None => Err(GraphRagError::GraphNotBuilt(graph_id.to_string())),
        }
    }

    // =========================================================================
    // Index
    // =========================================================================

    /// Validate and chunk documents in the background.
    ///
    /// Documents are immutable: re-submitting an id with identical content
    /// is a no-op, with different content it is rejected.
    pub fn index(&self, graph_id: &str, documents: Vec<Document>) -> IndexingHandle {
        let (tx, rx) = watch::channel(JobStatus::Pending);
        let service = self.clone();
        let id = graph_id.to_string();
        let task = tokio::spawn(async move {
            tx.send_replace(JobStatus::Running);
            let report = service.index_documents(&id, documents).await;
            let all_rejected = !report.rejected.is_empty()
                && report.accepted.is_empty()
                && report.unchanged.is_empty();
            tx.send_replace(if all_rejected {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            });
            Ok(report)
        });
        IndexingHandle {
            graph_id: graph_id.to_string(),
            status: rx,
            task,
        }
    }

    async fn index_documents(&self, graph_id: &str, documents: Vec<Document>) -> IndexingReport {
        let state = self.state(graph_id).await;
        let mut corpus = state.corpus.lock().await;
        let mut report = IndexingReport {
            graph_id: graph_id.to_string(),
            ..IndexingReport::default()
        };

        for document in documents {
            match self.admit(&corpus, &document) {
                Ok(Admission::Unchanged) => report.unchanged.push(document.id),
                Ok(Admission::New(chunks)) => {
                    debug!(document_id = %document.id, chunks = chunks.len(), "Document chunked");
                    report.chunks += chunks.len();
                    report.accepted.push(document.id.clone());
                    corpus.rejected.remove(&document.id);
                    corpus.chunks.insert(document.id.clone(), chunks);
                    corpus.documents.insert(document.id.clone(), document);
                }
                Err(err) => {
                    warn!(document_id = %document.id, error = %err, "Document rejected");
                    let unit = FailedUnit::from_error(&document.id, &err);
                    if !corpus.documents.contains_key(&document.id) {
                        corpus.rejected.insert(document.id.clone(), unit.clone());
                    }
                    report.rejected.push(unit);
                }
            }
        }
        info!(
            graph_id,
            accepted = report.accepted.len(),
            unchanged = report.unchanged.len(),
            rejected = report.rejected.len(),
            chunks = report.chunks,
            "index.completed"
        );
        report
    }

    fn admit(&self, corpus: &Corpus, document: &Document) -> Result<Admission> {
        let malformed = |reason: &str| GraphRagError::MalformedDocument {
            document_id: document.id.clone(),
            reason: reason.to_string(),
        };
        if document.id.trim().is_empty() {
            return Err(malformed("document id is empty"));
        }
        if let Some(existing) = corpus.documents.get(&document.id) {
            return if existing.content_hash() == document.content_hash() {
                Ok(Admission::Unchanged)
            } else {
                Err(malformed("document id already ingested with different content"))
            };
        }
        if document.text.trim().is_empty() {
            return Err(malformed("document has no text"));
        }
        let chunks = self.inner.chunker.chunk(document);
        if chunks.is_empty() {
            return Err(malformed("document produced no chunks"));
        }
        Ok(Admission::New(chunks))
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Build the graph from every document ingested for `graph_id`.
    /// With `force_rebuild` the extraction cache is not read.
    pub fn build(&self, graph_id: &str, force_rebuild: bool) -> BuildHandle {
        let (tx, rx) = watch::channel(JobStatus::Pending);
        let cancel = CancellationToken::new();
        let service = self.clone();
        let id = graph_id.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = service.run_build(&id, force_rebuild, &token, &tx).await;
            tx.send_replace(match &result {
                Ok(_) => JobStatus::Succeeded,
                Err(GraphRagError::Cancelled(_)) => JobStatus::Cancelled,
                Err(_) => JobStatus::Failed,
            });
            result
        });
        BuildHandle {
            graph_id: graph_id.to_string(),
            status: rx,
            cancel,
            task,
        }
    }

    async fn run_build(
        &self,
        graph_id: &str,
        force_rebuild: bool,
        cancel: &CancellationToken,
        status: &watch::Sender<JobStatus>,
    ) -> Result<BuildManifest> {
        let state = self.state(graph_id).await;
        let _exclusive = state.build_lock.lock().await;
        status.send_replace(JobStatus::Running);

        let input = {
            let corpus = state.corpus.lock().await;
            BuildInput {
                graph_id: graph_id.to_string(),
                documents: corpus.documents.values().cloned().collect(),
                chunks: corpus.chunks.values().flatten().cloned().collect(),
                rejected: corpus.rejected.values().cloned().collect(),
                force_rebuild,
            }
        };

        let snapshot = self.inner.pipeline.build(input, cancel).await?;
        let manifest = snapshot.manifest.clone();
        *state.snapshot.write().await = Some(Arc::new(snapshot));
        Ok(manifest)
    }

    // =========================================================================
    // Query
    // =========================================================================

    /// Answer a question. The method is validated before the graph is looked
    /// up, so an invalid method is reported even for unbuilt graphs.
    pub async fn query(&self, graph_id: &str, request: QueryRequest) -> Result<QueryResult> {
        let strategy = self.inner.router.route(&request)?;
        let method = strategy.method();
        let snapshot = self.snapshot(graph_id).await?;

        let started = Instant::now();
        let ctx = SearchContext {
            snapshot: &snapshot,
            model: self.inner.model.as_ref(),
            budget: &self.inner.query_budget,
            retry: &self.inner.query_retry,
            filters: &request.filters,
        };
        let result = strategy.search(ctx, &request.question).await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("graphrag_queries_total", "method" => method.as_str(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("graphrag_query_duration_seconds", "method" => method.as_str())
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(graph_id, %method, error = %e, "Query failed");
        }
        result
    }

    /// Look up an entity or community by id.
    pub async fn fetch(&self, graph_id: &str, node_id: &str) -> Result<GraphNode> {
        let snapshot = self.snapshot(graph_id).await?;
        let graph = &snapshot.graph;
        if let Some(entity) = graph.entities.get(node_id) {
            return Ok(GraphNode::Entity(entity.clone()));
        }
        if let Some(community) = graph.communities.get(node_id) {
            return Ok(GraphNode::Community {
                community: community.clone(),
                report: graph.reports.get(node_id).cloned(),
            });
        }
        Err(GraphRagError::NodeNotFound {
            graph_id: graph_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    /// Manifest of the last completed build.
    pub async fn stats(&self, graph_id: &str) -> Result<BuildManifest> {
        Ok(self.snapshot(graph_id).await?.manifest.clone())
    }

    // =========================================================================
    // Archive / restore
    // =========================================================================

    pub async fn archive(&self, graph_id: &str, dir: &Path) -> Result<ArchiveManifest> {
        let snapshot = self.snapshot(graph_id).await?;
        write_archive(&snapshot, dir).await
    }

    /// Load an archive as the current snapshot of `graph_id`. Its documents
    /// and chunks join the corpus so later builds include them.
    ///
    /// An archived document whose id is already ingested with different
    /// content is rejected with `MalformedDocument` and nothing changes.
    pub async fn restore(&self, graph_id: &str, dir: &Path) -> Result<BuildManifest> {
        let state = self.state(graph_id).await;
        let _exclusive = state.build_lock.lock().await;

        let snapshot = read_archive(
            graph_id,
            dir,
            Arc::clone(&self.inner.embedder),
            self.inner.stores.create(graph_id),
            self.inner.config.embedding.batch_size,
        )
        .await?;

        {
            let mut corpus = state.corpus.lock().await;
            if let Some(conflict) = snapshot.documents.values().find(|d| {
                corpus
                    .documents
                    .get(&d.id)
                    .is_some_and(|existing| existing.content_hash() != d.content_hash())
            }) {
                warn!(graph_id, document_id = %conflict.id, "Archive conflicts with ingested document");
                return Err(GraphRagError::MalformedDocument {
                    document_id: conflict.id.clone(),
                    reason: "document id already ingested with different content".to_string(),
                });
            }
            for (id, document) in &snapshot.documents {
                corpus.documents.insert(id.clone(), document.clone());
                corpus.rejected.remove(id);
            }
            let mut by_document: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
            for chunk in snapshot.chunks.values() {
                by_document
                    .entry(chunk.document_id.clone())
                    .or_default()
                    .push(chunk.clone());
            }
            for (document_id, mut chunks) in by_document {
                chunks.sort_by_key(|c| c.position);
                corpus.chunks.insert(document_id, chunks);
            }
        }

        let manifest = snapshot.manifest.clone();
        *state.snapshot.write().await = Some(Arc::new(snapshot));
        Ok(manifest)
    }
}

enum Admission {
    New(Vec<Chunk>),
    Unchanged,
}
