//! GraphRAG Domain Models
//!
//! Entity, relationship, community, report and citation structures for
//! knowledge graph-enhanced retrieval.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Entity Types
// =============================================================================

/// Entity type label, one of the configured closed set (lowercase).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(label: impl AsRef<str>) -> Self {
        Self(label.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of entity types the extractor is allowed to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTypeSet(BTreeSet<EntityType>);

impl EntityTypeSet {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(labels.into_iter().map(EntityType::new).collect())
    }

    /// Resolve a raw label from model output; `None` when outside the set.
    pub fn resolve(&self, label: &str) -> Option<EntityType> {
        let candidate = EntityType::new(label);
        self.0.contains(&candidate).then_some(candidate)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.0.iter().map(EntityType::as_str).collect()
    }
}

/// Identity normalisation: Unicode lowercase, alphanumerics only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

// =============================================================================
// Entity
// =============================================================================

/// A canonical entity resolved across chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier derived from the identity key
    pub id: String,
    /// Display name (most frequent surface form)
    pub name: String,
    /// Entity type classification
    pub entity_type: EntityType,
    /// Aggregated description
    pub description: String,
    /// IDs of supporting chunks (never empty)
    pub chunk_ids: BTreeSet<String>,
    /// Number of relationships touching this entity
    #[serde(default)]
    pub degree: usize,
}

// =============================================================================
// Relationship
// =============================================================================

/// A relationship between two resolved entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    /// Source entity ID
    pub source_id: String,
    /// Target entity ID
    pub target_id: String,
    /// Aggregated description
    pub description: String,
    /// Number of supporting mentions
    pub weight: f64,
    /// IDs of supporting chunks
    pub chunk_ids: BTreeSet<String>,
    /// Whether the extraction gave the pair a direction
    #[serde(default)]
    pub directed: bool,
}

impl Relationship {
    /// The other endpoint, if `entity_id` is one of the two.
    pub fn other_end(&self, entity_id: &str) -> Option<&str> {
        if self.source_id == entity_id {
            Some(&self.target_id)
        } else if self.target_id == entity_id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}

// =============================================================================
// Community
// =============================================================================

/// A cluster of entities at one hierarchy level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    /// Unique identifier (`<level>-<ordinal>`)
    pub id: String,
    /// Hierarchy level (0 = root partition, higher = finer)
    pub level: u32,
    /// IDs of member entities, sorted
    pub member_entity_ids: Vec<String>,
    /// Parent community at `level - 1`
    #[serde(default)]
    pub parent_community_id: Option<String>,
    /// Child communities at `level + 1`
    #[serde(default)]
    pub child_community_ids: Vec<String>,
}

/// One finding inside a community report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub summary: String,
    pub explanation: String,
}

/// LLM-generated summary of a community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityReport {
    pub community_id: String,
    pub title: String,
    pub summary: String,
    /// Importance rating assigned by the summariser (0-10)
    pub rating: f32,
    pub findings: Vec<Finding>,
    /// Entities the report is about
    pub key_entity_ids: Vec<String>,
}

impl CommunityReport {
    /// Text used for embedding and for search context.
    pub fn full_text(&self) -> String {
        let mut out = format!("# {}\n\n{}", self.title, self.summary);
        for finding in &self.findings {
            out.push_str("\n\n## ");
            out.push_str(&finding.summary);
            out.push('\n');
            out.push_str(&finding.explanation);
        }
        out
    }
}

// =============================================================================
// Citation
// =============================================================================

/// Kind of record a citation points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Chunk,
    Entity,
    Community,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Chunk => "chunk",
            Self::Entity => "entity",
            Self::Community => "community",
        })
    }
}

/// A pointer from an answer span to its supporting record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source_type: SourceType,
    pub source_id: String,
    /// Snippet of the cited content
    pub excerpt: String,
}

// =============================================================================
// Extraction Result
// =============================================================================

/// An entity candidate as returned by the extractor for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
}

/// A relationship candidate between two names from the same chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub description: String,
    #[serde(default)]
    pub directed: bool,
}

/// Result of entity/relationship extraction from a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Extracted entities
    pub entities: Vec<ExtractedEntity>,
    /// Extracted relationships
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

// =============================================================================
// Knowledge Graph
// =============================================================================

/// The canonical graph produced by one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub entities: BTreeMap<String, Entity>,
    pub relationships: BTreeMap<String, Relationship>,
    pub communities: BTreeMap<String, Community>,
    pub reports: BTreeMap<String, CommunityReport>,
}

impl KnowledgeGraph {
    /// Relationships touching `entity_id`.
    pub fn relationships_of<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships
            .values()
            .filter(move |r| r.source_id == entity_id || r.target_id == entity_id)
    }

    /// Communities at a given level, in id order.
    pub fn communities_at(&self, level: u32) -> impl Iterator<Item = &Community> {
        self.communities.values().filter(move |c| c.level == level)
    }

    /// Deepest hierarchy level present, if any community exists.
    pub fn max_level(&self) -> Option<u32> {
        self.communities.values().map(|c| c.level).max()
    }

    /// Check the structural invariants: every entity has a supporting chunk,
    /// every relationship references existing entities, and the community
    /// hierarchy is a forest whose children nest inside their parents.
    pub fn check_invariants(&self) -> Result<(), String> {
        for e in self.entities.values() {
            if e.chunk_ids.is_empty() {
                return Err(format!("entity {} has no supporting chunk", e.id));
            }
        }
        for r in self.relationships.values() {
            if !self.entities.contains_key(&r.source_id) || !self.entities.contains_key(&r.target_id)
            {
                return Err(format!("relationship {} has a dangling endpoint", r.id));
            }
        }
        for c in self.communities.values() {
            if let Some(parent_id) = &c.parent_community_id {
                let parent = self
                    .communities
                    .get(parent_id)
                    .ok_or_else(|| format!("community {} has missing parent", c.id))?;
                if parent.level + 1 != c.level {
                    return Err(format!("community {} skips a level", c.id));
                }
                let parent_members: BTreeSet<&String> = parent.member_entity_ids.iter().collect();
                if !c.member_entity_ids.iter().all(|m| parent_members.contains(m)) {
                    return Err(format!("community {} cross-cuts its parent", c.id));
                }
            } else if c.level != 0 {
                return Err(format!("community {} is a non-root orphan", c.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_set_resolution() {
        let set = EntityTypeSet::new(["organization", "person", "geo", "event"]);
        assert_eq!(set.resolve("PERSON"), Some(EntityType::new("person")));
        assert_eq!(set.resolve(" Organization "), Some(EntityType::new("organization")));
        assert_eq!(set.resolve("disease"), None);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Diabetes Canada"), "diabetescanada");
        assert_eq!(normalize_name("DIABETES-CANADA."), "diabetescanada");
        assert_eq!(normalize_name("Dr. Smith"), "drsmith");
        assert_eq!(normalize_name(" ... "), "");
    }

    #[test]
    fn test_invariants_detect_dangling_relationship() {
        let mut graph = KnowledgeGraph::default();
        graph.relationships.insert(
            "r1".into(),
            Relationship {
                id: "r1".into(),
                source_id: "a".into(),
                target_id: "b".into(),
                description: String::new(),
                weight: 1.0,
                chunk_ids: BTreeSet::new(),
                directed: false,
            },
        );
        assert!(graph.check_invariants().is_err());
    }

    #[test]
    fn test_report_full_text() {
        let report = CommunityReport {
            community_id: "0-0".into(),
            title: "Diabetes care".into(),
            summary: "Clinicians and hospitals.".into(),
            rating: 5.0,
            findings: vec![Finding {
                summary: "Toronto General".into(),
                explanation: "Treats diabetes.".into(),
            }],
            key_entity_ids: vec![],
        };
        let text = report.full_text();
        assert!(text.starts_with("# Diabetes care"));
        assert!(text.contains("## Toronto General"));
    }
}
