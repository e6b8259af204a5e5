//! Drift search: local search widened by model-proposed follow-up questions.
//!
//! Each round shows the model the current context and the intermediate
//! answers of earlier rounds, takes its follow-up questions and pulls in the
//! entities nearest to them. Rounds stop at the
//! configured limit, when a round adds no new entity, or when the refine
//! call fails. The final context also carries the reports of every
//! community the discovered entities belong to.

use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::Result;
use crate::graphrag::defaults::{DRIFT_REFINE_SYSTEM, render};
use crate::graphrag::domain::Entity;
use crate::llm::CompletionRequest;

use super::SearchContext;
use super::context::AssembledContext;
use super::local::{graph_context, nearest_entities, ranked_chunks, related_reports};

/// Community reports added to the final drift context.
const DRIFT_REPORTS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct DriftSearch {
    pub top_k_entities: usize,
    pub top_k_chunks: usize,
    pub max_rounds: usize,
    pub follow_ups: usize,
    pub local_max_tokens: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct Refinement {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    follow_ups: Vec<String>,
}

impl DriftSearch {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            top_k_entities: config.top_k_entities,
            top_k_chunks: config.top_k_chunks,
            max_rounds: config.drift_max_rounds,
            follow_ups: config.drift_follow_ups,
            local_max_tokens: config.local_max_tokens,
            max_tokens: config.drift_max_tokens,
        }
    }

    pub async fn assemble(&self, ctx: SearchContext<'_>, question: &str) -> Result<AssembledContext> {
        let query = ctx.snapshot.index.embed_query(question).await?;
        let mut entities: Vec<&Entity> = nearest_entities(ctx, &query, self.top_k_entities).await?;
        let mut known: BTreeSet<&str> = entities.iter().copied().map(|e| e.id.as_str()).collect();
        let mut findings: Vec<String> = Vec::new();

        for round in 1..=self.max_rounds {
            if entities.is_empty() {
                break;
            }
            let chunks = ranked_chunks(ctx, &query, &entities, self.top_k_chunks).await?;
            let interim = graph_context(ctx, &entities, &chunks, &[], self.local_max_tokens);
            let earlier = if findings.is_empty() {
                "(none yet)".to_string()
            } else {
                findings.join("\n")
            };
            let system = render(
                DRIFT_REFINE_SYSTEM,
                &[("findings", &earlier), ("context", &interim.render())],
            );
            let refinement = match ctx
                .complete_json::<Refinement>(CompletionRequest::new(system, question))
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(round, error = %e, "Drift refinement failed, keeping current context");
                    break;
                }
            };

            let mut added = 0;
            for follow_up in refinement
                .follow_ups
                .iter()
                .map(|q| q.trim())
                .filter(|q| !q.is_empty())
                .take(self.follow_ups)
            {
                let vector = ctx.snapshot.index.embed_query(follow_up).await?;
                for entity in nearest_entities(ctx, &vector, self.top_k_entities).await? {
                    if known.insert(entity.id.as_str()) {
                        entities.push(entity);
                        added += 1;
                    }
                }
            }
            debug!(round, added, "Drift round complete");
            let answer = refinement.answer.trim();
            if !answer.is_empty() {
                findings.push(format!("- Round {round}: {answer}"));
            }
            if added == 0 {
                break;
            }
        }

        let chunks = ranked_chunks(ctx, &query, &entities, self.top_k_chunks).await?;
        let reports = related_reports(ctx, &entities, DRIFT_REPORTS);
        Ok(graph_context(ctx, &entities, &chunks, &reports, self.max_tokens))
    }
}
