//! Guideline GraphRAG
//!
//! Turns clinical guideline documents into a deduplicated knowledge graph
//! with hierarchical communities, and answers questions against it with
//! source citations.
//!
//! # Architecture
//!
//! - **Ingestion**: documents are chunked into token windows, a language
//!   model extracts entities and relationships per chunk, and the results
//!   are folded into one graph.
//! - **Communities**: seeded Leiden clustering with recursive subdivision,
//!   summarised into community reports.
//! - **Retrieval**: local, global, drift and basic search over the graph and
//!   an embedding index, with citations limited to the assembled context.
//!
//! # Modules
//!
//! - [`config`]: layered configuration and CLI
//! - [`llm`]: language model driver, retry policy and call budget
//! - [`graphrag`]: the pipeline, the index and the query engine

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod error;
pub mod graphrag;
pub mod llm;

pub use error::{GraphRagError, Result};
pub use graphrag::GraphRagService;
