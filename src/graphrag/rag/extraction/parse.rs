//! Validation of model output against the extraction schema.
//!
//! Model responses are untrusted: anything that is not a JSON object with the
//! expected shape is reported as [`LlmError::MalformedResponse`] so the call
//! goes back through the retry path. Individual items that are well formed
//! but unusable (empty names, types outside the configured set) are dropped.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::graphrag::domain::{
    EntityTypeSet, ExtractedEntity, ExtractedRelationship, ExtractionResult,
};
use crate::llm::LlmError;

#[derive(Debug, Deserialize)]
struct RawExtraction {
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", alias = "entity_type", default)]
    entity_type: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    #[serde(default)]
    source: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    directed: bool,
}

/// Locate the JSON object in a response that may be wrapped in code fences
/// or surrounded by prose.
pub fn json_payload(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

/// Deserialize the JSON object embedded in a model response.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let payload = json_payload(raw)
        .ok_or_else(|| LlmError::MalformedResponse("response contains no JSON object".into()))?;
    serde_json::from_str(payload).map_err(|e| LlmError::MalformedResponse(e.to_string()))
}

/// Parse and validate one extraction response.
pub fn parse_extraction(raw: &str, types: &EntityTypeSet) -> Result<ExtractionResult, LlmError> {
    let parsed: RawExtraction = parse_json(raw)?;

    let entities = parsed
        .entities
        .into_iter()
        .filter_map(|e| {
            let name = e.name.trim();
            if name.is_empty() {
                return None;
            }
            let entity_type = types.resolve(&e.entity_type)?;
            Some(ExtractedEntity {
                name: name.to_string(),
                entity_type,
                description: e.description.trim().to_string(),
            })
        })
        .collect();

    let relationships = parsed
        .relationships
        .into_iter()
        .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
        .map(|r| ExtractedRelationship {
            source: r.source.trim().to_string(),
            target: r.target.trim().to_string(),
            description: r.description.trim().to_string(),
            directed: r.directed,
        })
        .collect();

    Ok(ExtractionResult {
        entities,
        relationships,
    })
}
