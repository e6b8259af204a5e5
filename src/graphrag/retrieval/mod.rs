//! Query engine: method routing, context assembly, answering and citation.
//!
//! The four strategies share one skeleton. Each builds an
//! [`AssembledContext`] in its own way; answer generation and citation
//! assembly are common.
//!
//! ```text
//! QueryRequest ──▶ router ──▶ SearchStrategy::assemble ──▶ answer ──▶ citation
//!                              (local | global | drift | basic)
//! ```

pub mod basic;
pub mod citation;
pub mod context;
pub mod drift;
pub mod fusion;
pub mod global;
pub mod local;
pub mod router;

pub use basic::BasicSearch;
pub use citation::CitedAnswer;
pub use context::{AssembledContext, ContextBuilder, ContextRecord};
pub use drift::DriftSearch;
pub use global::GlobalSearch;
pub use local::LocalSearch;
pub use router::QueryRouter;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::QueryConfig;
use crate::error::{GraphRagError, Result};
use crate::graphrag::defaults::{ANSWER_SYSTEM, render};
use crate::graphrag::domain::{QueryFilters, QueryResult, SearchMethod};
use crate::graphrag::rag::extraction::parse::parse_json;
use crate::graphrag::snapshot::GraphSnapshot;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, ModelBudget, RetryPolicy};

/// Answer returned when no context could be assembled.
pub const NO_CONTEXT_ANSWER: &str = "No relevant information was found in the indexed guidelines.";

/// Read-only inputs shared by every strategy for one query.
#[derive(Debug, Clone, Copy)]
pub struct SearchContext<'a> {
    pub snapshot: &'a GraphSnapshot,
    pub model: &'a dyn LanguageModel,
    pub budget: &'a ModelBudget,
    pub retry: &'a RetryPolicy,
    pub filters: &'a QueryFilters,
}

impl SearchContext<'_> {
    /// One model call under the retry policy.
    pub async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let model = self.model;
        self.retry
            .run(self.budget, |_| model.complete(request.clone()))
            .await
            .map_err(|failure| match failure.error {
                LlmError::RateLimited { .. } => GraphRagError::RateLimited {
                    retries: failure.attempts.saturating_sub(1),
                },
                error => GraphRagError::Llm(error),
            })
    }

    /// Like [`complete`](Self::complete) but a response that does not parse
    /// as `T` is retried.
    pub async fn complete_json<T: DeserializeOwned>(&self, request: CompletionRequest) -> Result<T> {
        let model = self.model;
        let request = request.json();
        self.retry
            .run(self.budget, |_| {
                let request = request.clone();
                async move { parse_json::<T>(&model.complete(request).await?) }
            })
            .await
            .map_err(|failure| match failure.error {
                LlmError::RateLimited { .. } => GraphRagError::RateLimited {
                    retries: failure.attempts.saturating_sub(1),
                },
                error => GraphRagError::Llm(error),
            })
    }
}

/// One of the four retrieval strategies with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchStrategy {
    Local(LocalSearch),
    Global(GlobalSearch),
    Drift(DriftSearch),
    Basic(BasicSearch),
}

impl SearchStrategy {
    pub fn for_method(method: SearchMethod, config: &QueryConfig) -> Self {
        match method {
            SearchMethod::Local => Self::Local(LocalSearch::from_config(config)),
            SearchMethod::Global => Self::Global(GlobalSearch::from_config(config)),
            SearchMethod::Drift => Self::Drift(DriftSearch::from_config(config)),
            SearchMethod::Basic => Self::Basic(BasicSearch::from_config(config)),
        }
    }

    pub fn method(&self) -> SearchMethod {
        match self {
            Self::Local(_) => SearchMethod::Local,
            Self::Global(_) => SearchMethod::Global,
            Self::Drift(_) => SearchMethod::Drift,
            Self::Basic(_) => SearchMethod::Basic,
        }
    }

    /// Select and rank the context records for `question`.
    pub async fn assemble(&self, ctx: SearchContext<'_>, question: &str) -> Result<AssembledContext> {
        match self {
            Self::Local(s) => s.assemble(ctx, question).await,
            Self::Global(s) => s.assemble(ctx, question).await,
            Self::Drift(s) => s.assemble(ctx, question).await,
            Self::Basic(s) => s.assemble(ctx, question).await,
        }
    }

    /// Assemble, generate and cite.
    pub async fn search(&self, ctx: SearchContext<'_>, question: &str) -> Result<QueryResult> {
        let method = self.method();
        let context = self.assemble(ctx, question).await?;
        debug!(%method, records = context.records.len(), "Context assembled");

        let raw = if context.is_empty() {
            NO_CONTEXT_ANSWER.to_string()
        } else {
            let system = render(ANSWER_SYSTEM, &[("context", &context.render())]);
            ctx.complete(CompletionRequest::new(system, question)).await?
        };

        let cited = citation::assemble(&raw, &context);
        info!(
            %method,
            records = context.records.len(),
            citations = cited.citations.len(),
            "query.answered"
        );
        Ok(QueryResult {
            answer: cited.answer,
            segments: cited.segments,
            citations: cited.citations,
            method,
            context_sources: context.sources(),
        })
    }
}
