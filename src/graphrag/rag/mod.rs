//! Ingestion and graph construction.
//!
//! - [`loader`] reads documents from disk.
//! - [`chunking`] splits documents into token windows.
//! - [`extraction`] turns chunks into entities and relationships.
//! - [`graph_builder`] folds extractions into one deduplicated graph.
//! - [`community`] clusters the graph and writes community reports.
//! - [`pipeline`] runs the whole build.

pub mod cache;
pub mod chunking;
pub mod community;
pub mod extraction;
pub mod graph_builder;
pub mod loader;
pub mod pipeline;

pub use cache::ExtractionCache;
pub use chunking::{Chunker, ChunkingError};
pub use graph_builder::GraphAccumulator;
pub use pipeline::{BuildInput, BuildManifest, FailedUnit, GraphPipeline, GraphStats};
