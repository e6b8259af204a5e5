//! Immutable view of one completed build.

use std::collections::BTreeMap;

use crate::graphrag::domain::{Chunk, Community, Document, Entity, KnowledgeGraph, QueryFilters};
use crate::graphrag::embedding::EmbeddingIndex;
use crate::graphrag::service::BuildManifest;

/// Everything a query needs, frozen at the end of a successful build.
///
/// Queries hold an `Arc<GraphSnapshot>`; a rebuild assembles a new snapshot
/// and swaps it in, so readers never see a half-merged graph.
#[derive(Debug)]
pub struct GraphSnapshot {
    pub graph_id: String,
    pub graph: KnowledgeGraph,
    pub documents: BTreeMap<String, Document>,
    pub chunks: BTreeMap<String, Chunk>,
    pub index: EmbeddingIndex,
    pub manifest: BuildManifest,
}

impl GraphSnapshot {
    pub fn chunk_allowed(&self, chunk: &Chunk, filters: &QueryFilters) -> bool {
        filters.document_ids.is_empty() || filters.document_ids.contains(&chunk.document_id)
    }

    /// An entity passes when its type is allowed and at least one supporting
    /// chunk belongs to an allowed document.
    pub fn entity_allowed(&self, entity: &Entity, filters: &QueryFilters) -> bool {
        let type_ok = filters.entity_types.is_empty()
            || filters
                .entity_types
                .iter()
                .any(|t| t.trim().eq_ignore_ascii_case(entity.entity_type.as_str()));
        let doc_ok = filters.document_ids.is_empty()
            || entity.chunk_ids.iter().any(|id| {
                self.chunks
                    .get(id)
                    .is_some_and(|c| self.chunk_allowed(c, filters))
            });
        type_ok && doc_ok
    }

    /// Communities (any level) that contain the entity, shallowest first.
    pub fn communities_of(&self, entity_id: &str) -> Vec<&Community> {
        let mut found: Vec<&Community> = self
            .graph
            .communities
            .values()
            .filter(|c| c.member_entity_ids.iter().any(|m| m == entity_id))
            .collect();
        found.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
        found
    }
}
