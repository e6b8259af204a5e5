//! Global search: map-reduce over community reports at one hierarchy level.
//!
//! The map step asks the model to rate every report 0-100 for the question.
//! A report whose rating call fails is scored by embedding similarity x100
//! when the index is reachable, otherwise 0. The best reports form the
//! context for the reduce step, which is the shared answer call.

use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::Result;
use crate::graphrag::defaults::{GLOBAL_MAP_SYSTEM, render};
use crate::graphrag::domain::{CommunityReport, SourceType};
use crate::graphrag::embedding::{VectorKind, cosine_similarity};
use crate::llm::CompletionRequest;

use super::SearchContext;
use super::context::{AssembledContext, ContextBuilder};
use super::local::entity_text;

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSearch {
    pub level: u32,
    pub top_reports: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct MapResponse {
    score: f32,
    #[serde(default)]
    points: Vec<String>,
}

#[derive(Debug)]
struct ScoredReport<'a> {
    report: &'a CommunityReport,
    score: f32,
    points: Vec<String>,
}

impl GlobalSearch {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            level: config.global_level,
            top_reports: config.global_top_reports,
            max_tokens: config.global_max_tokens,
        }
    }

    pub async fn assemble(&self, ctx: SearchContext<'_>, question: &str) -> Result<AssembledContext> {
        let graph = &ctx.snapshot.graph;
        let Some(max_level) = graph.max_level() else {
            return Ok(self.entity_context(ctx));
        };
        let level = self.level.min(max_level);
        let reports: Vec<&CommunityReport> = graph
            .communities_at(level)
            .filter(|c| self.community_allowed(ctx, &c.member_entity_ids))
            .filter_map(|c| graph.reports.get(&c.id))
            .collect();
        if reports.is_empty() {
            return Ok(self.entity_context(ctx));
        }

        // Global search keeps working on report text alone when embeddings fail.
        let query = match ctx.snapshot.index.embed_query(question).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Query embedding unavailable, map fallback scores are zero");
                None
            }
        };

        let concurrency = ctx.budget.concurrency().max(1);
        let mut scored: Vec<ScoredReport<'_>> = futures::stream::iter(reports)
            .map(|report| self.score(ctx, question, report, query.as_deref()))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.report.rating.total_cmp(&a.report.rating))
                .then_with(|| a.report.community_id.cmp(&b.report.community_id))
        });
        let relevant = scored.iter().filter(|s| s.score > 0.0).count();
        if relevant > 0 {
            scored.truncate(relevant);
        }
        debug!(level, candidates = scored.len(), relevant, "Global map step done");

        let mut builder = ContextBuilder::new(self.max_tokens);
        for item in scored.into_iter().take(self.top_reports) {
            let mut text = item.report.full_text();
            if !item.points.is_empty() {
                text.push_str("\n\nRelevant points:\n- ");
                text.push_str(&item.points.join("\n- "));
            }
            builder.push(SourceType::Community, &item.report.community_id, &text);
        }
        Ok(builder.finish())
    }

    async fn score<'a>(
        &self,
        ctx: SearchContext<'_>,
        question: &str,
        report: &'a CommunityReport,
        query: Option<&[f32]>,
    ) -> ScoredReport<'a> {
        let system = render(GLOBAL_MAP_SYSTEM, &[("report", &report.full_text())]);
        match ctx
            .complete_json::<MapResponse>(CompletionRequest::new(system, question))
            .await
        {
            Ok(map) => ScoredReport {
                report,
                score: map.score.clamp(0.0, 100.0),
                points: map
                    .points
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
            },
            Err(e) => {
                warn!(community_id = %report.community_id, error = %e, "Map step failed, using similarity");
                let score = match query {
                    Some(q) => ctx
                        .snapshot
                        .index
                        .store()
                        .get(VectorKind::CommunityReport, &report.community_id)
                        .await
                        .ok()
                        .flatten()
                        .map_or(0.0, |v| (cosine_similarity(q, &v) * 100.0).max(0.0)),
                    None => 0.0,
                };
                ScoredReport {
                    report,
                    score,
                    points: Vec::new(),
                }
            }
        }
    }

    fn community_allowed(&self, ctx: SearchContext<'_>, members: &[String]) -> bool {
        ctx.filters.is_empty()
            || members.iter().any(|id| {
                ctx.snapshot
                    .graph
                    .entities
                    .get(id)
                    .is_some_and(|e| ctx.snapshot.entity_allowed(e, ctx.filters))
            })
    }

    /// Narrow context used when no community reports exist: the most
    /// connected entities.
    fn entity_context(&self, ctx: SearchContext<'_>) -> AssembledContext {
        let graph = &ctx.snapshot.graph;
        let mut entities: Vec<_> = graph
            .entities
            .values()
            .filter(|e| ctx.snapshot.entity_allowed(e, ctx.filters))
            .collect();
        entities.sort_by(|a, b| b.degree.cmp(&a.degree).then_with(|| a.id.cmp(&b.id)));
        debug!(entities = entities.len(), "No community reports, using entity context");

        let mut builder = ContextBuilder::new(self.max_tokens);
        for entity in entities {
            if !builder.push(SourceType::Entity, &entity.id, &entity_text(graph, entity)) {
                break;
            }
        }
        builder.finish()
    }
}
