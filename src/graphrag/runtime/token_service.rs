//! Token counting and windowing over a BPE encoding.

use std::sync::{Arc, OnceLock};

use tiktoken_rs::CoreBPE;

/// Errors raised when an encoding cannot be loaded.
#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("Unknown token encoding: {0}")]
    UnknownEncoding(String),
    #[error("Failed to load token encoding {name}: {reason}")]
    Load { name: String, reason: String },
}

#[derive(Clone)]
pub struct TokenService {
    encoding: String,
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("encoding", &self.encoding)
            .finish()
    }
}

static CL100K: OnceLock<Option<TokenService>> = OnceLock::new();

impl TokenService {
    /// Load a named encoding (`cl100k_base`, `o200k_base`, `p50k_base`, `r50k_base`).
    pub fn for_encoding(name: &str) -> Result<Self, TokenizerError> {
        let loaded = match name {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => return Err(TokenizerError::UnknownEncoding(other.to_string())),
        };
        let bpe = loaded.map_err(|e| TokenizerError::Load {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            encoding: name.to_string(),
            bpe: Arc::new(bpe),
        })
    }

    /// Process-wide cl100k_base instance used for budget estimates.
    pub fn shared() -> Option<&'static TokenService> {
        CL100K
            .get_or_init(|| Self::for_encoding("cl100k_base").ok())
            .as_ref()
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_with_special_tokens(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Decode a token window. A window edge may split a multi-byte character;
    /// in that case the edges are widened by up to three tokens until the
    /// bytes form valid UTF-8, and any leftover replacement characters are
    /// stripped.
    pub fn decode_window(&self, tokens: &[u32], start: usize, end: usize) -> String {
        let end = end.min(tokens.len());
        for widen in 0..=3usize {
            let s = start.saturating_sub(widen);
            let e = (end + widen).min(tokens.len());
            let window = tokens[s..e].iter().map(|&t| t as _).collect::<Vec<_>>();
            if let Ok(text) = self.bpe.decode(window) {
                return text.trim_matches('\u{FFFD}').to_string();
            }
        }
        String::new()
    }

    /// Estimate tokens with the shared encoding, falling back to four bytes
    /// per token when the encoding cannot be loaded.
    pub fn estimate_string(content: &str) -> usize {
        match Self::shared() {
            Some(service) => service.count(content),
            None => content.len().div_ceil(4),
        }
    }

    /// Longest prefix of `content` (on a char boundary) that fits `max_tokens`.
    pub fn truncate_to(content: &str, max_tokens: usize) -> &str {
        if Self::estimate_string(content) <= max_tokens {
            return content;
        }
        let bounds: Vec<usize> = content
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(content.len()))
            .collect();
        let (mut lo, mut hi) = (0usize, bounds.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if Self::estimate_string(&content[..bounds[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        &content[..bounds[lo]]
    }
}
