//! Model-backed extractor with gleaning.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::parse::parse_extraction;
use super::{ChunkExtraction, EntityExtractor, ExtractionConfig};
use crate::error::GraphRagError;
use crate::graphrag::defaults::{EXTRACTION_SYSTEM, EXTRACTION_USER, GLEANING_USER, render};
use crate::graphrag::domain::{Chunk, ExtractionResult, normalize_name};
use crate::llm::retry::RetryFailure;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, Message, ModelBudget};

/// Extracts entities and relationships by prompting a language model, then
/// re-prompts ("gleans") for anything the previous pass missed.
#[derive(Clone)]
pub struct LlmEntityExtractor {
    model: Arc<dyn LanguageModel>,
    config: ExtractionConfig,
}

impl std::fmt::Debug for LlmEntityExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmEntityExtractor")
            .field("model", &self.model.model_id())
            .field("max_gleanings", &self.config.max_gleanings)
            .field("max_retries", &self.config.retry.max_retries)
            .finish()
    }
}

impl LlmEntityExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, config: ExtractionConfig) -> Self {
        Self { model, config }
    }

    /// One validated model call under the retry policy. Returns the parsed
    /// result, the raw response and the number of calls made.
    async fn call(
        &self,
        messages: &[Message],
        budget: &ModelBudget,
    ) -> Result<(ExtractionResult, String, u32), RetryFailure> {
        let mut used = 0;
        let outcome = self
            .config
            .retry
            .run(budget, |attempt| {
                used = attempt;
                let model = Arc::clone(&self.model);
                let types = self.config.entity_types.clone();
                let request = CompletionRequest {
                    messages: messages.to_vec(),
                    temperature: Some(0.0),
                    json_mode: true,
                };
                async move {
                    metrics::counter!("graphrag_extraction_attempts_total").increment(1);
                    let raw = model.complete(request).await?;
                    let parsed = parse_extraction(&raw, &types)?;
                    Ok::<_, LlmError>((parsed, raw))
                }
            })
            .await?;
        Ok((outcome.0, outcome.1, used))
    }
}

fn relationship_key(r: &crate::graphrag::domain::ExtractedRelationship) -> (String, String, String) {
    (
        normalize_name(&r.source),
        normalize_name(&r.target),
        r.description.clone(),
    )
}

#[async_trait]
impl EntityExtractor for LlmEntityExtractor {
    async fn extract(
        &self,
        chunk: &Chunk,
        budget: &ModelBudget,
    ) -> Result<ChunkExtraction, GraphRagError> {
        let labels = self.config.entity_types.labels().join(", ");
        let mut messages = vec![
            Message::system(render(EXTRACTION_SYSTEM, &[("entity_types", &labels)])),
            Message::user(render(EXTRACTION_USER, &[("text", &chunk.text)])),
        ];

        let (mut result, mut raw, mut attempts) =
            self.call(&messages, budget).await.map_err(|failure| {
                metrics::counter!("graphrag_extraction_failures_total").increment(1);
                GraphRagError::ExtractionFailed {
                    chunk_id: chunk.id.clone(),
                    attempts: failure.attempts,
                    reason: failure.error.to_string(),
                }
            })?;

        let mut seen_entities: BTreeSet<(String, String)> = result
            .entities
            .iter()
            .map(|e| (e.entity_type.to_string(), normalize_name(&e.name)))
            .collect();
        let mut seen_relationships: BTreeSet<_> =
            result.relationships.iter().map(relationship_key).collect();

        let mut rounds = 0;
        for round in 1..=self.config.max_gleanings {
            messages.push(Message::assistant(std::mem::take(&mut raw)));
            messages.push(Message::user(GLEANING_USER));

            let (gleaned, gleaned_raw, used) = match self.call(&messages, budget).await {
                Ok(out) => out,
                Err(failure) => {
                    attempts += failure.attempts;
                    warn!(
                        chunk_id = %chunk.id,
                        round,
                        error = %failure.error,
                        "Gleaning round failed, keeping earlier results"
                    );
                    break;
                }
            };
            attempts += used;
            rounds = round;
            metrics::counter!("graphrag_gleaning_rounds_total").increment(1);

            let new_entities: Vec<_> = gleaned
                .entities
                .into_iter()
                .filter(|e| seen_entities.insert((e.entity_type.to_string(), normalize_name(&e.name))))
                .collect();
            result.relationships.extend(
                gleaned
                    .relationships
                    .into_iter()
                    .filter(|r| seen_relationships.insert(relationship_key(r))),
            );

            debug!(chunk_id = %chunk.id, round, new_entities = new_entities.len(), "Gleaning round");
            if new_entities.is_empty() {
                break;
            }
            result.entities.extend(new_entities);
            raw = gleaned_raw;
        }

        Ok(ChunkExtraction {
            result,
            gleaning_rounds: rounds,
            attempts,
        })
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}
