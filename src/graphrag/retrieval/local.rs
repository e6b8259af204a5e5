//! Local search: entities near the question, their text units and the
//! communities they belong to.

use std::collections::BTreeMap;

use crate::config::QueryConfig;
use crate::error::Result;
use crate::graphrag::domain::{CommunityReport, Entity, KnowledgeGraph, SourceType};
use crate::graphrag::embedding::VectorKind;

use super::SearchContext;
use super::context::{AssembledContext, ContextBuilder};
use super::fusion::{FusionConfig, fuse};

/// Relationship lines appended to an entity record.
const RELATIONSHIPS_PER_ENTITY: usize = 5;
/// Community reports added after entities and chunks.
const LOCAL_REPORTS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalSearch {
    pub top_k_entities: usize,
    pub top_k_chunks: usize,
    pub max_tokens: usize,
}

impl LocalSearch {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            top_k_entities: config.top_k_entities,
            top_k_chunks: config.top_k_chunks,
            max_tokens: config.local_max_tokens,
        }
    }

    pub async fn assemble(&self, ctx: SearchContext<'_>, question: &str) -> Result<AssembledContext> {
        let query = ctx.snapshot.index.embed_query(question).await?;
        let entities = nearest_entities(ctx, &query, self.top_k_entities).await?;
        let chunk_ids = ranked_chunks(ctx, &query, &entities, self.top_k_chunks).await?;
        let reports = related_reports(ctx, &entities, LOCAL_REPORTS);
        Ok(graph_context(ctx, &entities, &chunk_ids, &reports, self.max_tokens))
    }
}

// =============================================================================
// Shared with drift search
// =============================================================================

/// Up to `k` entities by similarity to `query`, honouring the filters.
pub(crate) async fn nearest_entities<'a>(
    ctx: SearchContext<'a>,
    query: &[f32],
    k: usize,
) -> Result<Vec<&'a Entity>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let graph = &ctx.snapshot.graph;
    let fetch = if ctx.filters.is_empty() { k } else { graph.entities.len() };
    let hits = ctx.snapshot.index.search(VectorKind::Entity, query, fetch).await?;
    Ok(hits
        .iter()
        .filter_map(|hit| graph.entities.get(&hit.id))
        .filter(|e| ctx.snapshot.entity_allowed(e, ctx.filters))
        .take(k)
        .collect())
}

/// Chunk ids by vector similarity fused with the chunks supporting the
/// selected entities (ranked by how many of them they support).
pub(crate) async fn ranked_chunks(
    ctx: SearchContext<'_>,
    query: &[f32],
    entities: &[&Entity],
    k: usize,
) -> Result<Vec<String>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let fetch = if ctx.filters.is_empty() { k } else { ctx.snapshot.chunks.len() };
    let vector: Vec<String> = ctx
        .snapshot
        .index
        .search(VectorKind::Chunk, query, fetch)
        .await?
        .into_iter()
        .map(|hit| hit.id)
        .filter(|id| chunk_visible(ctx, id))
        .collect();

    let mut support: BTreeMap<&str, usize> = BTreeMap::new();
    for entity in entities {
        for chunk_id in &entity.chunk_ids {
            *support.entry(chunk_id.as_str()).or_default() += 1;
        }
    }
    let mut graph: Vec<(&str, usize)> = support
        .into_iter()
        .filter(|(id, _)| chunk_visible(ctx, id))
        .collect();
    graph.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let graph: Vec<String> = graph.into_iter().map(|(id, _)| id.to_string()).collect();

    Ok(fuse(&FusionConfig::default(), &vector, &graph)
        .into_iter()
        .take(k)
        .map(|f| f.id)
        .collect())
}

fn chunk_visible(ctx: SearchContext<'_>, chunk_id: &str) -> bool {
    ctx.snapshot
        .chunks
        .get(chunk_id)
        .is_some_and(|c| ctx.snapshot.chunk_allowed(c, ctx.filters))
}

/// Reports of the communities holding the most selected entities; deeper
/// (more specific) communities win ties.
pub(crate) fn related_reports<'a>(
    ctx: SearchContext<'a>,
    entities: &[&Entity],
    limit: usize,
) -> Vec<&'a CommunityReport> {
    let graph = &ctx.snapshot.graph;
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for entity in entities {
        for community in ctx.snapshot.communities_of(&entity.id) {
            if graph.reports.contains_key(&community.id) {
                *counts.entry(community.id.as_str()).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<(&str, usize, u32)> = counts
        .into_iter()
        .filter_map(|(id, n)| Some((id, n, graph.communities.get(id)?.level)))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| b.2.cmp(&a.2))
            .then_with(|| a.0.cmp(b.0))
    });
    ranked
        .into_iter()
        .filter_map(|(id, _, _)| graph.reports.get(id))
        .take(limit)
        .collect()
}

/// Entity record text: name, type, description and its strongest
/// relationships.
pub(crate) fn entity_text(graph: &KnowledgeGraph, entity: &Entity) -> String {
    let mut text = format!(
        "{} ({}): {}",
        entity.name,
        entity.entity_type,
        entity.description.replace('\n', " ")
    );
    let mut relationships: Vec<_> = graph.relationships_of(&entity.id).collect();
    relationships.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
    for rel in relationships.into_iter().take(RELATIONSHIPS_PER_ENTITY) {
        if let Some(other) = rel.other_end(&entity.id).and_then(|id| graph.entities.get(id)) {
            text.push_str(&format!(
                "\n- {} {}: {}",
                if rel.directed && rel.source_id == entity.id { "->" } else { "--" },
                other.name,
                rel.description.replace('\n', " ")
            ));
        }
    }
    text
}

/// Entities, then chunks, then community reports, within `max_tokens`.
pub(crate) fn graph_context(
    ctx: SearchContext<'_>,
    entities: &[&Entity],
    chunk_ids: &[String],
    reports: &[&CommunityReport],
    max_tokens: usize,
) -> AssembledContext {
    let snapshot = ctx.snapshot;
    let mut builder = ContextBuilder::new(max_tokens);
    for entity in entities {
        builder.push(SourceType::Entity, &entity.id, &entity_text(&snapshot.graph, entity));
    }
    for chunk_id in chunk_ids {
        if let Some(chunk) = snapshot.chunks.get(chunk_id) {
            builder.push(SourceType::Chunk, &chunk.id, &chunk.text);
        }
    }
    for report in reports {
        builder.push(SourceType::Community, &report.community_id, &report.full_text());
    }
    builder.finish()
}
