//! Numbered context window shared by every search strategy.
//!
//! Each record gets a 1-based label `[n]`. The model is asked to cite labels,
//! and the citation assembler maps labels back to record ids, so a citation
//! can only ever point at something that was in the window.

use std::collections::BTreeSet;

use crate::graphrag::domain::{SourceRef, SourceType};
use crate::graphrag::runtime::TokenService;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextRecord {
    pub label: usize,
    pub source: SourceRef,
    pub text: String,
}

impl ContextRecord {
    fn render(&self) -> String {
        format!(
            "[{}] ({} {}) {}",
            self.label, self.source.source_type, self.source.source_id, self.text
        )
    }
}

/// The records a strategy showed to the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub records: Vec<ContextRecord>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, label: usize) -> Option<&ContextRecord> {
        label
            .checked_sub(1)
            .and_then(|i| self.records.get(i))
            .filter(|r| r.label == label)
    }

    pub fn render(&self) -> String {
        self.records
            .iter()
            .map(ContextRecord::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        self.records.iter().map(|r| r.source.clone()).collect()
    }
}

/// Adds records in priority order until the token budget is spent.
#[derive(Debug)]
pub struct ContextBuilder {
    max_tokens: usize,
    used_tokens: usize,
    records: Vec<ContextRecord>,
    seen: BTreeSet<SourceRef>,
}

impl ContextBuilder {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            used_tokens: 0,
            records: Vec::new(),
            seen: BTreeSet::new(),
        }
    }

    /// Add a record if it fits. A record that is too large on its own is
    /// truncated only when the window is still empty. Duplicate sources are
    /// ignored. Returns whether the record was added.
    pub fn push(&mut self, source_type: SourceType, source_id: &str, text: &str) -> bool {
        let source = SourceRef {
            source_type,
            source_id: source_id.to_string(),
        };
        if self.seen.contains(&source) || text.trim().is_empty() {
            return false;
        }

        let mut record = ContextRecord {
            label: self.records.len() + 1,
            source,
            text: text.trim().to_string(),
        };
        let mut cost = TokenService::estimate_string(&record.render()) + 1;
        if self.used_tokens + cost > self.max_tokens {
            if !self.records.is_empty() {
                return false;
            }
            let overhead = cost.saturating_sub(TokenService::estimate_string(&record.text));
            let room = self.max_tokens.saturating_sub(overhead + 1);
            record.text = TokenService::truncate_to(&record.text, room).to_string();
            if record.text.is_empty() {
                return false;
            }
            cost = TokenService::estimate_string(&record.render()) + 1;
        }

        self.used_tokens += cost;
        self.seen.insert(record.source.clone());
        self.records.push(record);
        true
    }

    pub fn used_tokens(&self) -> usize {
        self.used_tokens
    }

    pub fn finish(self) -> AssembledContext {
        AssembledContext {
            records: self.records,
        }
    }
}
