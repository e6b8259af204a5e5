//! Basic search: nearest text units only, no graph traversal.

use crate::config::QueryConfig;
use crate::error::Result;
use crate::graphrag::domain::SourceType;
use crate::graphrag::embedding::VectorKind;

use super::SearchContext;
use super::context::{AssembledContext, ContextBuilder};

#[derive(Debug, Clone, PartialEq)]
pub struct BasicSearch {
    pub top_k_chunks: usize,
    pub max_tokens: usize,
}

impl BasicSearch {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            top_k_chunks: config.top_k_chunks,
            max_tokens: config.basic_max_tokens,
        }
    }

    pub async fn assemble(&self, ctx: SearchContext<'_>, question: &str) -> Result<AssembledContext> {
        let snapshot = ctx.snapshot;
        let query = snapshot.index.embed_query(question).await?;
        let fetch = if ctx.filters.is_empty() {
            self.top_k_chunks
        } else {
            snapshot.chunks.len()
        };
        let hits = snapshot.index.search(VectorKind::Chunk, &query, fetch).await?;

        let mut builder = ContextBuilder::new(self.max_tokens);
        for chunk in hits
            .iter()
            .filter_map(|hit| snapshot.chunks.get(&hit.id))
            .filter(|c| snapshot.chunk_allowed(c, ctx.filters))
            .take(self.top_k_chunks)
        {
            builder.push(SourceType::Chunk, &chunk.id, &chunk.text);
        }
        Ok(builder.finish())
    }
}
