//! Error kinds surfaced by the ingestion pipeline and the query engine.
//!
//! Per-unit failures (a chunk, a document, a community report) are recorded
//! in a [`BuildManifest`](crate::graphrag::service::BuildManifest) and never
//! abort a build. Query-time failures are returned to the caller as-is.

use crate::llm::LlmError;

/// Errors that can occur while indexing, building or querying a graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphRagError {
    /// A chunk's extraction call exhausted its retries.
    #[error("Extraction failed for chunk {chunk_id} after {attempts} attempts: {reason}")]
    ExtractionFailed {
        chunk_id: String,
        attempts: u32,
        reason: String,
    },

    /// The document could not be parsed and was rejected before chunking.
    #[error("Malformed document {document_id}: {reason}")]
    MalformedDocument { document_id: String, reason: String },

    /// A query was issued before any successful build of the graph.
    #[error("Graph {0} has no completed build")]
    GraphNotBuilt(String),

    /// The requested search method is not one of local/global/drift/basic.
    #[error("Unsupported search method: {0:?}")]
    UnsupportedMethod(String),

    /// The embedding backend could not be reached.
    #[error("Embedding index unavailable: {0}")]
    IndexUnavailable(String),

    /// The model backend kept throttling after the retry ceiling.
    #[error("Rate limited by model backend after {retries} retries")]
    RateLimited { retries: u32 },

    /// Direct lookup of an id that is neither an entity nor a community.
    #[error("Node {node_id} not found in graph {graph_id}")]
    NodeNotFound { graph_id: String, node_id: String },

    /// A finished build produced a structurally inconsistent graph.
    #[error("Graph {graph_id} failed consistency checks: {violation}")]
    InvariantViolation { graph_id: String, violation: String },

    /// The build was cancelled before completion.
    #[error("Build of graph {0} was cancelled")]
    Cancelled(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Archive or restore failure.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Language model failure that is not retried (e.g. answer generation).
    #[error("Language model error: {0}")]
    Llm(#[from] LlmError),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphRagError {
    /// Stable, machine readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::MalformedDocument { .. } => "malformed_document",
            Self::GraphNotBuilt(_) => "graph_not_built",
            Self::UnsupportedMethod(_) => "unsupported_method",
            Self::IndexUnavailable(_) => "index_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::NodeNotFound { .. } => "node_not_found",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Archive(_) => "archive",
            Self::Llm(_) => "llm",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Result type alias for graph operations.
pub type Result<T> = std::result::Result<T, GraphRagError>;
