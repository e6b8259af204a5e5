//! Knowledge-graph retrieval over clinical guideline documents.
//!
//! # Modules
//!
//! - [`domain`]: documents, chunks, graph records and query models
//! - [`rag`]: loading, chunking, extraction, graph building, communities
//! - [`embedding`]: embedders and vector stores
//! - [`retrieval`]: query routing, the four search strategies, citations
//! - [`persistence`]: archive and restore
//! - [`service`]: index / build / query / fetch entry points

pub mod defaults;
pub mod domain;
pub mod embedding;
pub mod persistence;
pub mod rag;
pub mod retrieval;
pub mod runtime;
pub mod service;
pub mod snapshot;
pub mod telemetry;

pub use service::{BuildHandle, GraphNode, GraphRagService, IndexingHandle, IndexingReport, JobStatus};
pub use snapshot::GraphSnapshot;
