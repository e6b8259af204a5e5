//! Deterministic document chunking.
//!
//! Three strategies are available:
//!
//! - `tokens`: strict sliding window over the BPE token stream with a stride
//!   of `size - overlap`.
//! - `sentences`: sentence-aware packing (via `text_splitter`) measured in
//!   tokens, with overlapping trailing text between neighbours.
//! - `group`: packs whole structured records (JSON objects, CSV rows) and only
//!   token-splits a single record that is larger than the chunk size.
//!
//! Chunk ids are UUID v5 digests of the document id, position and text, so
//! the same document and configuration always yield the same chunks.

use text_splitter::{ChunkConfig, ChunkSizer, TextSplitter};
use uuid::Uuid;

use crate::config::{ChunkStrategyKind, ChunkingConfig};
use crate::graphrag::domain::{Chunk, Document};
use crate::graphrag::runtime::{TokenService, TokenizerError};

#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error("Invalid chunking configuration: {0}")]
    InvalidConfig(String),
}

/// Measures chunk size in tokens of the configured encoding.
struct TokenSizer<'a>(&'a TokenService);

impl ChunkSizer for TokenSizer<'_> {
    fn size(&self, chunk: &str) -> usize {
        self.0.count(chunk)
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    tokens: TokenService,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ChunkingError> {
        if config.size == 0 || config.overlap >= config.size {
            return Err(ChunkingError::InvalidConfig(format!(
                "overlap ({}) must be smaller than size ({})",
                config.overlap, config.size
            )));
        }
        let tokens = TokenService::for_encoding(&config.encoding)?;
        Ok(Self { config, tokens })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Stable description of the configuration; part of the extraction cache key.
    pub fn fingerprint(&self) -> String {
        let strategy = match self.config.strategy {
            ChunkStrategyKind::Tokens => "tokens",
            ChunkStrategyKind::Sentences => "sentences",
        };
        format!(
            "{strategy}:{}:{}:{}",
            self.config.size, self.config.overlap, self.config.encoding
        )
    }

    /// Split a document: structured records are grouped, free text uses the
    /// configured strategy.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        if let Some(records) = &document.records {
            return self.chunk_records(&document.id, records);
        }
        if document.text.trim().is_empty() {
            return Vec::new();
        }
        match self.config.strategy {
            ChunkStrategyKind::Tokens => self.chunk_tokens(&document.id, &document.text, 0, 0),
            ChunkStrategyKind::Sentences => self.chunk_sentences(&document.id, &document.text),
        }
    }

    fn chunk_tokens(
        &self,
        document_id: &str,
        text: &str,
        first_position: usize,
        token_offset: usize,
    ) -> Vec<Chunk> {
        let tokens = self.tokens.encode(text);
        let stride = self.config.size - self.config.overlap;
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < tokens.len() {
            let end = (start + self.config.size).min(tokens.len());
            let window = self.tokens.decode_window(&tokens, start, end);
            if !window.trim().is_empty() {
                let position = first_position + chunks.len();
                let overlap_tokens = if chunks.is_empty() {
                    0
                } else {
                    self.config.overlap
                };
                chunks.push(make_chunk(
                    document_id,
                    position,
                    window,
                    token_offset + start,
                    token_offset + end,
                    overlap_tokens,
                    "tokens",
                ));
            }
            if end == tokens.len() {
                break;
            }
            start += stride;
        }
        chunks
    }

    fn chunk_sentences(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let config = match ChunkConfig::new(self.config.size)
            .with_sizer(TokenSizer(&self.tokens))
            .with_trim(true)
            .with_overlap(self.config.overlap)
        {
            Ok(config) => config,
            // Overlap is checked in `new`; fall back to plain token windows.
            Err(_) => return self.chunk_tokens(document_id, text, 0, 0),
        };
        let splitter = TextSplitter::new(config);

        let mut chunks: Vec<Chunk> = Vec::new();
        for (position, (offset, piece)) in splitter.chunk_indices(text).enumerate() {
            let start_token = self.tokens.count(&text[..offset]);
            let token_count = self.tokens.count(piece);
            let overlap_tokens = chunks
                .last()
                .map(|prev| prev.end_token.saturating_sub(start_token))
                .unwrap_or(0);
            chunks.push(make_chunk(
                document_id,
                position,
                piece.to_string(),
                start_token,
                start_token + token_count,
                overlap_tokens,
                "sentences",
            ));
        }
        chunks
    }

    /// Pack structured records into chunks without splitting a record unless
    /// it alone exceeds the chunk size.
    pub fn chunk_records(&self, document_id: &str, records: &[String]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut buffer: Vec<&str> = Vec::new();
        let mut buffer_tokens = 0usize;
        let mut buffer_start = 0usize;
        let mut cursor = 0usize;

        for record in records.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            let record_tokens = self.tokens.count(record);

            if record_tokens > self.config.size {
                self.flush_group(document_id, &mut buffer, buffer_start, &mut chunks);
                buffer_tokens = 0;
                let mut split = self.chunk_tokens(document_id, record, chunks.len(), cursor);
                for chunk in &mut split {
                    chunk.strategy = "group".to_string();
                }
                chunks.extend(split);
                cursor += record_tokens;
                buffer_start = cursor;
                continue;
            }

            if buffer_tokens + record_tokens > self.config.size && !buffer.is_empty() {
                self.flush_group(document_id, &mut buffer, buffer_start, &mut chunks);
                buffer_tokens = 0;
                buffer_start = cursor;
            }
            buffer.push(record);
            buffer_tokens += record_tokens;
            cursor += record_tokens;
        }
        self.flush_group(document_id, &mut buffer, buffer_start, &mut chunks);
        chunks
    }

    fn flush_group(
        &self,
        document_id: &str,
        buffer: &mut Vec<&str>,
        start_token: usize,
        chunks: &mut Vec<Chunk>,
    ) {
        if buffer.is_empty() {
            return;
        }
        let text = buffer.join("\n");
        buffer.clear();
        let token_count = self.tokens.count(&text);
        chunks.push(make_chunk(
            document_id,
            chunks.len(),
            text,
            start_token,
            start_token + token_count,
            0,
            "group",
        ));
    }
}

fn make_chunk(
    document_id: &str,
    position: usize,
    text: String,
    start_token: usize,
    end_token: usize,
    overlap_tokens: usize,
    strategy: &str,
) -> Chunk {
    let key = format!("{document_id}\n{position}\n{text}");
    Chunk {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string(),
        document_id: document_id.to_string(),
        position,
        text,
        start_token,
        end_token,
        token_count: end_token - start_token,
        overlap_tokens,
        strategy: strategy.to_string(),
    }
}
