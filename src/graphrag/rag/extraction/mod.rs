//! Entity and Relationship Extraction
//!
//! Provides the trait interface for extracting entities and relationships
//! from chunks, the model-backed implementation with gleaning, and the
//! bounded worker pool that runs extraction over a whole build.

pub mod llm;
pub mod parse;
pub mod pool;

pub use llm::LlmEntityExtractor;
pub use pool::{ExtractionJob, ExtractionOutcome, ExtractionPool};

use async_trait::async_trait;

use crate::error::GraphRagError;
use crate::graphrag::domain::{Chunk, EntityTypeSet, ExtractionResult};
use crate::llm::{ModelBudget, RetryPolicy};

// =============================================================================
// Extraction Strategy Trait
// =============================================================================

/// Strategy for extracting entities and relationships from a chunk.
#[async_trait]
pub trait EntityExtractor: Send + Sync + std::fmt::Debug {
    /// Extract from one chunk. Every model call holds a permit of `budget`.
    ///
    /// Fails with [`GraphRagError::ExtractionFailed`] once the retry ceiling
    /// is exhausted.
    async fn extract(
        &self,
        chunk: &Chunk,
        budget: &ModelBudget,
    ) -> Result<ChunkExtraction, GraphRagError>;

    /// Get the name of this extraction strategy.
    fn name(&self) -> &'static str;
}

/// Extraction output for one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkExtraction {
    pub result: ExtractionResult,
    /// Gleaning rounds that ran after the initial pass.
    pub gleaning_rounds: u32,
    /// Model calls made, retries included.
    pub attempts: u32,
}

// =============================================================================
// Extraction Configuration
// =============================================================================

/// Configuration for extraction.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Closed set of entity types to extract
    pub entity_types: EntityTypeSet,
    /// Maximum gleaning rounds after the initial pass
    pub max_gleanings: u32,
    /// Retry policy for malformed or failed calls
    pub retry: RetryPolicy,
}

impl ExtractionConfig {
    pub fn from_app(config: &crate::config::AppConfig) -> Self {
        Self {
            entity_types: EntityTypeSet::new(&config.extraction.entity_types),
            max_gleanings: config.extraction.max_gleanings,
            retry: config.retry_policy(),
        }
    }
}
