//! Domain types shared by the pipeline, the index and the query engine.

pub mod document;
pub mod graph;
pub mod query;

pub use document::{Chunk, Document, DocumentSource};
pub use graph::{
    Citation, Community, CommunityReport, Entity, EntityType, EntityTypeSet, ExtractedEntity,
    ExtractedRelationship, ExtractionResult, Finding, KnowledgeGraph, Relationship, SourceType,
    normalize_name,
};
pub use query::{
    AnswerSegment, QueryFilters, QueryRequest, QueryResult, SearchMethod, SourceRef,
};
