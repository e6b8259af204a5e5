//! Language model driver traits and implementations.
//!
//! The pipeline talks to the model through the [`LanguageModel`] trait so the
//! extraction, summarisation and answer-generation steps stay independent of
//! the provider wire format.
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: OpenAI-compatible Chat Completions API
//!
//! # Shared resources
//!
//! - [`ModelBudget`]: concurrency permits plus a request-rate limiter, passed
//!   explicitly to every worker that calls the model.
//! - [`RetryPolicy`]: bounded exponential backoff for retryable failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use guideline_graphrag::llm::{ChatCompletionsDriver, LlmSettings, Provider};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.openai.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o-mini".to_string(),
//!     provider: Provider::OpenAI,
//!     timeout: std::time::Duration::from_secs(120),
//! };
//! let driver = ChatCompletionsDriver::new(settings)?;
//! ```

pub mod budget;
pub mod chat_completions;
pub mod provider;
pub mod retry;

pub use budget::ModelBudget;
pub use chat_completions::ChatCompletionsDriver;
pub use provider::Provider;
pub use retry::RetryPolicy;

use std::time::Duration;

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4o-mini`).
    pub model: String,
    /// Provider type (auto-detected from `base_url` if not specified).
    pub provider: Provider,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
}

/// A message in a completion request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content of the message.
    pub content: String,
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request to a language model.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Sampling temperature; `None` uses the provider default.
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl CompletionRequest {
    /// Build a request from a system instruction and a user prompt.
    #[must_use]
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(user)],
            temperature: Some(0.0),
            json_mode: false,
        }
    }

    /// Request a JSON object response.
    #[must_use]
    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Full prompt text, used by logging and test doubles.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Errors returned by a language model driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    /// The provider signalled throttling (HTTP 429 or equivalent).
    #[error("Rate limited by provider")]
    RateLimited {
        /// Server suggested delay, when provided.
        retry_after: Option<Duration>,
    },

    /// Connection or transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request exceeded its timeout.
    #[error("Request timed out")]
    Timeout,

    /// Non-success HTTP status.
    #[error("Provider returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// The provider answered but the payload did not match the expected shape.
    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Whether the failure is worth retrying with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Transport(_)
            | Self::Timeout
            | Self::MalformedResponse(_) => true,
            Self::Status { status, .. } => *status >= 500,
        }
    }
}

/// A language model that turns a prompt into text.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync + std::fmt::Debug {
    /// Produce a single completion for the request.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the request fails or the response is unusable.
    async fn complete(&self, req: CompletionRequest) -> Result<String, LlmError>;

    /// Identifier of the underlying model, used in cache keys and logs.
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_retryable());
        assert!(LlmError::MalformedResponse("x".into()).is_retryable());
        assert!(
            LlmError::Status {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::Status {
                status: 401,
                body: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_prompt_text_joins_messages() {
        let req = CompletionRequest::new("sys", "user");
        assert_eq!(req.prompt_text(), "sys\n\nuser");
        assert!(!req.json_mode);
        assert!(req.json().json_mode);
    }
}
