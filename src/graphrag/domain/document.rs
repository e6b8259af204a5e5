//! Source documents and the chunks cut from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a document came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSource {
    /// Human-readable title (file name for loaded files).
    pub title: String,
    /// Origin path or URI, if any.
    #[serde(default)]
    pub origin_path: Option<String>,
    /// File type (extension including the dot), if known.
    #[serde(default)]
    pub file_type: Option<String>,
    /// Ingestion timestamp (RFC3339).
    #[serde(default)]
    pub date_added: Option<String>,
}

/// A document submitted for ingestion. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub source: DocumentSource,
    /// Structured records (JSON array items, CSV rows). When present they
    /// are chunked as whole records and `text` is their newline join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<String>>,
}

impl Document {
    /// Create a document with a title-only source.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            source: DocumentSource {
                title: id.clone(),
                ..DocumentSource::default()
            },
            id,
            text: text.into(),
            records: None,
        }
    }

    /// Create a structured document from whole records.
    pub fn from_records(id: impl Into<String>, records: Vec<String>) -> Self {
        let mut doc = Self::new(id, records.join("\n"));
        doc.records = Some(records);
        doc
    }

    /// Attach source metadata.
    #[must_use]
    pub fn with_source(mut self, source: DocumentSource) -> Self {
        self.source = source;
        self
    }

    /// Hex SHA-256 of the document text; keys the extraction cache.
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(self.text.as_bytes()))
    }
}

/// A bounded token window of a document; the unit of extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Zero-based order within the document.
    pub position: usize,
    pub text: String,
    /// First token index (inclusive) relative to the document.
    pub start_token: usize,
    /// Last token index (exclusive) relative to the document.
    pub end_token: usize,
    pub token_count: usize,
    /// Tokens shared with the previous chunk.
    pub overlap_tokens: usize,
    /// Chunking strategy that produced this chunk.
    pub strategy: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = Document::new("d1", "Dr. Smith treats diabetes.");
        let b = Document::new("other-id", "Dr. Smith treats diabetes.");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
        assert_ne!(a.content_hash(), Document::new("d1", "x").content_hash());
    }
}
