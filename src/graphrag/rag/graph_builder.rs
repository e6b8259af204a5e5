//! Deduplicating graph fold.
//!
//! Per-chunk extraction results are folded into a [`GraphAccumulator`] whose
//! state only holds order-independent aggregates: ordered sets, integer
//! counts and per-form tallies. Folding the same results in any order, or
//! merging partial accumulators in any grouping, yields the same graph.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::graphrag::domain::{
    Entity, EntityType, ExtractionResult, KnowledgeGraph, Relationship, normalize_name,
};

/// Entity identity: type plus normalized name.
pub type EntityKey = (EntityType, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EntityAggregate {
    surface_forms: BTreeMap<String, usize>,
    descriptions: BTreeSet<String>,
    chunk_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RelationshipAggregate {
    mentions: u64,
    descriptions: BTreeSet<String>,
    chunk_ids: BTreeSet<String>,
    /// Orientations asserted by directed mentions.
    orientations: BTreeSet<(EntityKey, EntityKey)>,
}

/// Commutative, associative aggregation of extraction results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphAccumulator {
    entities: BTreeMap<EntityKey, EntityAggregate>,
    /// Keyed by the sorted pair of endpoint keys.
    relationships: BTreeMap<(EntityKey, EntityKey), RelationshipAggregate>,
    unresolved_relationships: usize,
    chunks: BTreeSet<String>,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk's extraction result.
    pub fn fold(&mut self, chunk_id: &str, result: &ExtractionResult) {
        self.chunks.insert(chunk_id.to_string());

        // Names seen in this chunk, for resolving relationship endpoints.
        let mut local: BTreeMap<String, BTreeSet<EntityKey>> = BTreeMap::new();

        for extracted in &result.entities {
            let normalized = normalize_name(&extracted.name);
            if normalized.is_empty() {
                continue;
            }
            let key = (extracted.entity_type.clone(), normalized.clone());
            let agg = self.entities.entry(key.clone()).or_default();
            *agg.surface_forms.entry(extracted.name.clone()).or_default() += 1;
            if !extracted.description.is_empty() {
                agg.descriptions.insert(extracted.description.clone());
            }
            agg.chunk_ids.insert(chunk_id.to_string());
            local.entry(normalized).or_default().insert(key);
        }

        let resolve = |name: &str| -> Option<EntityKey> {
            local
                .get(&normalize_name(name))
                .and_then(|keys| keys.iter().next().cloned())
        };

        for extracted in &result.relationships {
            let (Some(source), Some(target)) =
                (resolve(&extracted.source), resolve(&extracted.target))
            else {
                self.unresolved_relationships += 1;
                continue;
            };
            if source == target {
                self.unresolved_relationships += 1;
                continue;
            }
            let pair = if source <= target {
                (source.clone(), target.clone())
            } else {
                (target.clone(), source.clone())
            };
            let agg = self.relationships.entry(pair).or_default();
            agg.mentions += 1;
            if !extracted.description.is_empty() {
                agg.descriptions.insert(extracted.description.clone());
            }
            agg.chunk_ids.insert(chunk_id.to_string());
            if extracted.directed {
                agg.orientations.insert((source, target));
            }
        }
    }

    /// Merge another accumulator into this one.
    pub fn merge(&mut self, other: GraphAccumulator) {
        for (key, agg) in other.entities {
            let mine = self.entities.entry(key).or_default();
            for (form, count) in agg.surface_forms {
                *mine.surface_forms.entry(form).or_default() += count;
            }
            mine.descriptions.extend(agg.descriptions);
            mine.chunk_ids.extend(agg.chunk_ids);
        }
        for (pair, agg) in other.relationships {
            let mine = self.relationships.entry(pair).or_default();
            mine.mentions += agg.mentions;
            mine.descriptions.extend(agg.descriptions);
            mine.chunk_ids.extend(agg.chunk_ids);
            mine.orientations.extend(agg.orientations);
        }
        self.unresolved_relationships += other.unresolved_relationships;
        self.chunks.extend(other.chunks);
    }

    /// Relationship mentions dropped because an endpoint was not extracted
    /// from the same chunk.
    pub fn unresolved_relationships(&self) -> usize {
        self.unresolved_relationships
    }

    /// Produce the canonical entity and relationship records.
    pub fn finish(&self) -> KnowledgeGraph {
        let mut entities: BTreeMap<String, Entity> = BTreeMap::new();
        let mut ids: BTreeMap<&EntityKey, String> = BTreeMap::new();

        for (key, agg) in &self.entities {
            let id = entity_id(key);
            ids.insert(key, id.clone());
            entities.insert(
                id.clone(),
                Entity {
                    id,
                    name: display_name(&agg.surface_forms).unwrap_or_else(|| key.1.clone()),
                    entity_type: key.0.clone(),
                    description: join(&agg.descriptions),
                    chunk_ids: agg.chunk_ids.clone(),
                    degree: 0,
                },
            );
        }

        let mut relationships = BTreeMap::new();
        for ((a, b), agg) in &self.relationships {
            let (Some(a_id), Some(b_id)) = (ids.get(a), ids.get(b)) else {
                continue;
            };
            // A single asserted orientation makes the edge directed; none or
            // conflicting orientations leave it undirected.
            let (source_id, target_id, directed) = match agg.orientations.len() {
                1 => match agg.orientations.iter().next() {
                    Some((s, _)) if s == a => (a_id.clone(), b_id.clone(), true),
                    _ => (b_id.clone(), a_id.clone(), true),
                },
                _ => (a_id.clone(), b_id.clone(), false),
            };
            let id = relationship_id(a_id, b_id);
            relationships.insert(
                id.clone(),
                Relationship {
                    id,
                    source_id,
                    target_id,
                    description: join(&agg.descriptions),
                    weight: agg.mentions as f64,
                    chunk_ids: agg.chunk_ids.clone(),
                    directed,
                },
            );
        }

        for rel in relationships.values() {
            for end in [&rel.source_id, &rel.target_id] {
                if let Some(e) = entities.get_mut(end) {
                    e.degree += 1;
                }
            }
        }

        KnowledgeGraph {
            entities,
            relationships,
            ..KnowledgeGraph::default()
        }
    }
}

/// Stable entity id for an identity key.
pub fn entity_id(key: &EntityKey) -> String {
    let name = format!("entity:{}:{}", key.0, key.1);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn relationship_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let name = format!("relationship:{lo}:{hi}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Most frequent surface form; ties go to the lexicographically smallest.
fn display_name(forms: &BTreeMap<String, usize>) -> Option<String> {
    forms
        .iter()
        .max_by(|(a_form, a_n), (b_form, b_n)| a_n.cmp(b_n).then_with(|| b_form.cmp(a_form)))
        .map(|(form, _)| form.clone())
}

fn join(parts: &BTreeSet<String>) -> String {
    parts.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphrag::domain::{ExtractedEntity, ExtractedRelationship};

    fn entity(name: &str, ty: &str, desc: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.into(),
            entity_type: EntityType::new(ty),
            description: desc.into(),
        }
    }

    fn rel(s: &str, t: &str, desc: &str, directed: bool) -> ExtractedRelationship {
        ExtractedRelationship {
            source: s.into(),
            target: t.into(),
            description: desc.into(),
            directed,
        }
    }

    #[test]
    fn test_same_entity_merges_across_chunks() {
        let mut acc = GraphAccumulator::new();
        acc.fold(
            "c1",
            &ExtractionResult {
                entities: vec![entity("Diabetes Canada", "organization", "Publishes guidelines")],
                relationships: vec![],
            },
        );
        acc.fold(
            "c2",
            &ExtractionResult {
                entities: vec![entity("diabetes canada.", "organization", "Publishes guidelines")],
                relationships: vec![],
            },
        );
        let graph = acc.finish();
        assert_eq!(graph.entities.len(), 1);
        let e = graph.entities.values().next().unwrap();
        assert_eq!(e.chunk_ids.iter().collect::<Vec<_>>(), ["c1", "c2"]);
        assert_eq!(e.description, "Publishes guidelines");
        // Equal counts: lexicographically smallest surface form wins.
        assert_eq!(e.name, "Diabetes Canada");
    }

    #[test]
    fn test_same_name_different_type_stays_separate() {
        let mut acc = GraphAccumulator::new();
        acc.fold(
            "c1",
            &ExtractionResult {
                entities: vec![entity("Ontario", "geo", ""), entity("Ontario", "organization", "")],
                relationships: vec![],
            },
        );
        assert_eq!(acc.finish().entities.len(), 2);
    }

    #[test]
    fn test_relationship_weights_sum_symmetrically() {
        let mut acc = GraphAccumulator::new();
        let ents = vec![entity("Dr. Smith", "person", ""), entity("Toronto General", "organization", "")];
        acc.fold(
            "c1",
            &ExtractionResult {
                entities: ents.clone(),
                relationships: vec![rel("Dr. Smith", "Toronto General", "works at", false)],
            },
        );
        acc.fold(
            "c2",
            &ExtractionResult {
                entities: ents,
                relationships: vec![
                    rel("Toronto General", "Dr. Smith", "works at", false),
                    rel("Toronto General", "Dr. Smith", "employs", false),
                ],
            },
        );
        let graph = acc.finish();
        assert_eq!(graph.relationships.len(), 1);
        let r = graph.relationships.values().next().unwrap();
        assert_eq!(r.weight, 3.0);
        assert_eq!(r.description, "employs\nworks at");
        assert!(!r.directed);
        assert!(graph.entities.values().all(|e| e.degree == 1));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn test_unresolved_endpoints_are_counted() {
        let mut acc = GraphAccumulator::new();
        acc.fold(
            "c1",
            &ExtractionResult {
                entities: vec![entity("Dr. Smith", "person", "")],
                relationships: vec![
                    rel("Dr. Smith", "Nowhere Clinic", "visits", false),
                    rel("Dr. Smith", "dr smith", "self", false),
                ],
            },
        );
        assert_eq!(acc.unresolved_relationships(), 2);
        assert!(acc.finish().relationships.is_empty());
    }

    #[test]
    fn test_single_orientation_is_directed() {
        let mut acc = GraphAccumulator::new();
        acc.fold(
            "c1",
            &ExtractionResult {
                entities: vec![entity("CDA", "organization", ""), entity("Toronto", "geo", "")],
                relationships: vec![rel("Toronto", "CDA", "hosts", true)],
            },
        );
        let graph = acc.finish();
        let r = graph.relationships.values().next().unwrap();
        assert!(r.directed);
        assert_eq!(graph.entities[&r.source_id].name, "Toronto");
    }

    #[test]
    fn test_fold_order_and_merge_grouping_agree() {
        let results: Vec<(String, ExtractionResult)> = (0..4)
            .map(|i| {
                (
                    format!("c{i}"),
                    ExtractionResult {
                        entities: vec![
                            entity("Dr. Smith", "person", &format!("note {}", i % 2)),
                            entity(if i % 2 == 0 { "Toronto General" } else { "TORONTO GENERAL" }, "organization", ""),
                        ],
                        relationships: vec![rel("Dr. Smith", "Toronto General", "works at", i == 3)],
                    },
                )
            })
            .collect();

        let mut forward = GraphAccumulator::new();
        for (id, r) in &results {
            forward.fold(id, r);
        }
        let mut left = GraphAccumulator::new();
        let mut right = GraphAccumulator::new();
        for (id, r) in results.iter().rev().take(2) {
            right.fold(id, r);
        }
        for (id, r) in results.iter().take(2) {
            left.fold(id, r);
        }
        right.merge(left);

        assert_eq!(forward, right);
        assert_eq!(forward.finish(), right.finish());
    }
}
