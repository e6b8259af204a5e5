//! Offline doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use guideline_graphrag::config::AppConfig;
use guideline_graphrag::graphrag::GraphRagService;
use guideline_graphrag::graphrag::defaults::GLEANING_USER;
use guideline_graphrag::graphrag::embedding::{Embedder, EmbeddingError, InMemoryVectorStoreProvider};
use guideline_graphrag::llm::{CompletionRequest, LanguageModel, LlmError, MessageRole};

/// Language model that answers every prompt kind the pipeline sends.
///
/// Extraction responses are looked up by a needle found in the chunk text.
/// Chunks containing a `fail_needle` always get an unparsable response.
/// Drift refinements return the follow-ups scripted for their round, or a
/// single question about Dr. Smith when none are scripted.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    pub extractions: Vec<(String, String)>,
    pub fail_needles: Vec<String>,
    pub failed_calls: AtomicU32,
    pub calls: AtomicU32,
    pub delay: Option<Duration>,
    pub refinements: Vec<Vec<String>>,
    pub refine_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn extract(mut self, needle: &str, json: &str) -> Self {
        self.extractions.push((needle.to_string(), json.to_string()));
        self
    }

    #[must_use]
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.fail_needles.push(needle.to_string());
        self
    }

    /// Follow-up questions for each drift round, in order.
    #[must_use]
    pub fn refine_with(mut self, rounds: &[&[&str]]) -> Self {
        self.refinements = rounds
            .iter()
            .map(|r| r.iter().map(|q| q.to_string()).collect())
            .collect();
        self
    }

    pub fn refine_calls(&self) -> usize {
        self.refine_prompts.lock().unwrap().len()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn answer(system: &str) -> String {
        // Cite the first chunk record, otherwise the first record.
        let label = system
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix('[')?;
                let (n, tail) = rest.split_once(']')?;
                tail.trim_start().starts_with("(chunk ").then(|| n.to_string())
            })
            .unwrap_or_else(|| "1".to_string());
        format!("Dr. Smith treats diabetes at Toronto General [{label}]. Metformin is the usual first-line therapy.")
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, req: CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let system = req
            .messages
            .iter()
            .find(|m| m.role == MessageRole::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();

        if system.starts_with("You extract a knowledge graph") {
            if last == GLEANING_USER {
                return Ok(r#"{"entities": [], "relationships": []}"#.to_string());
            }
            if self.fail_needles.iter().any(|n| last.contains(n.as_str())) {
                self.failed_calls.fetch_add(1, Ordering::SeqCst);
                return Ok("I could not find any entities, sorry.".to_string());
            }
            return Ok(self
                .extractions
                .iter()
                .find(|(needle, _)| last.contains(needle.as_str()))
                .map_or_else(
                    || r#"{"entities": [], "relationships": []}"#.to_string(),
                    |(_, json)| json.clone(),
                ));
        }
        if system.starts_with("You write reports") {
            return Ok(r#"{"title": "Diabetes care in Toronto", "summary": "Clinicians and hospitals providing diabetes care.", "rating": 7.5, "findings": [{"summary": "Dr. Smith works at Toronto General", "explanation": "Dr. Smith treats diabetes at Toronto General."}]}"#.to_string());
        }
        if system.starts_with("You rate how useful") {
            return Ok(r#"{"score": 80, "points": ["Dr. Smith treats diabetes"]}"#.to_string());
        }
        if system.starts_with("You are exploring") {
            let round = {
                let mut prompts = self.refine_prompts.lock().unwrap();
                prompts.push(system.clone());
                prompts.len()
            };
            if self.refinements.is_empty() {
                return Ok(r#"{"answer": "Dr. Smith treats diabetes.", "follow_ups": ["Where does Dr. Smith work?"]}"#.to_string());
            }
            let follow_ups = self.refinements.get(round - 1).cloned().unwrap_or_default();
            return Ok(serde_json::json!({
                "answer": format!("Finding of round {round}"),
                "follow_ups": follow_ups,
            })
            .to_string());
        }
        if system.starts_with("You answer questions") {
            return Ok(Self::answer(&system));
        }
        Err(LlmError::Status {
            status: 400,
            body: "unexpected prompt".to_string(),
        })
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Bag-of-words embedder hashed into a fixed number of dimensions.
#[derive(Debug)]
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: 64 }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; self.dimensions];
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let mut hasher = DefaultHasher::new();
                    word.to_lowercase().hash(&mut hasher);
                    v[(hasher.finish() % self.dimensions as u64) as usize] += 1.0;
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    v.iter_mut().for_each(|x| *x /= norm);
                }
                v
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        "hashing-64"
    }
}

/// Embedder whose backend is always down.
#[derive(Debug)]
pub struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Embed("connection refused".to_string()))
    }

    fn model_id(&self) -> &str {
        "down"
    }
}

/// Defaults with zero backoff so retry tests run instantly.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.extraction.backoff_base_ms = 0;
    config.extraction.backoff_max_ms = 0;
    config.extraction.concurrency = 4;
    config
}

pub fn service_with(config: AppConfig, model: Arc<ScriptedModel>) -> GraphRagService {
    GraphRagService::new(
        config,
        model,
        Arc::new(HashingEmbedder::default()),
        Arc::new(InMemoryVectorStoreProvider),
    )
    .expect("service")
}

pub const SMITH_TEXT: &str = "Dr. Smith treats diabetes at Toronto General.";

pub const SMITH_EXTRACTION: &str = r#"{
  "entities": [
    {"name": "Dr. Smith", "type": "person", "description": "Physician who treats diabetes"},
    {"name": "Toronto General", "type": "organization", "description": "Hospital in Toronto"}
  ],
  "relationships": [
    {"source": "Dr. Smith", "target": "Toronto General", "description": "Dr. Smith treats diabetes at Toronto General"}
  ]
}"#;

pub fn smith_model() -> ScriptedModel {
    ScriptedModel::new().extract("Dr. Smith", SMITH_EXTRACTION)
}
