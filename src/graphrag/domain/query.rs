//! Query request/response models.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::graph::{Citation, SourceType};
use crate::error::GraphRagError;

/// Search strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Local,
    Global,
    Drift,
    Basic,
}

impl SearchMethod {
    pub const ALL: [SearchMethod; 4] = [Self::Local, Self::Global, Self::Drift, Self::Basic];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::Drift => "drift",
            Self::Basic => "basic",
        }
    }
}

impl std::fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMethod {
    type Err = GraphRagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            "drift" => Ok(Self::Drift),
            "basic" => Ok(Self::Basic),
            _ => Err(GraphRagError::UnsupportedMethod(s.to_string())),
        }
    }
}

/// Optional narrowing of the retrieval candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
    /// Only use chunks (and entities supported by chunks) from these documents.
    #[serde(default)]
    pub document_ids: Vec<String>,
    /// Only use entities of these types.
    #[serde(default)]
    pub entity_types: Vec<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.document_ids.is_empty() && self.entity_types.is_empty()
    }
}

/// A question against a built graph.
///
/// `method` is kept as the raw caller-supplied value so that an omitted
/// method (default `local`) stays distinguishable from an invalid one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// One claim-bearing span of the answer with its citation anchors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSegment {
    pub text: String,
    /// Indices into [`QueryResult::citations`].
    pub citations: Vec<usize>,
}

/// Identifier of a record shown to the model while answering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: SourceType,
    pub source_id: String,
}

/// Answer plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub segments: Vec<AnswerSegment>,
    /// Deduplicated, in order of first use.
    pub citations: Vec<Citation>,
    pub method: SearchMethod,
    /// Every record included in the assembled context.
    pub context_sources: Vec<SourceRef>,
}
