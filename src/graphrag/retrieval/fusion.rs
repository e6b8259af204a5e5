//! Reciprocal Rank Fusion (RRF)
//!
//! Combines a vector-similarity ranking with a graph-derived ranking of the
//! same kind of record.

use std::collections::HashMap;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for rank fusion.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Weight for vector search results
    pub vector_weight: f32,
    /// Weight for graph results
    pub graph_weight: f32,
    /// RRF constant k (typically 60)
    pub rrf_k: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            graph_weight: 0.5,
            rrf_k: 60.0,
        }
    }
}

/// Source of a fused result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalSource {
    Vector,
    Graph,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub id: String,
    pub score: f32,
    pub source: RetrievalSource,
}

/// Fuse two rankings (best first). Ties are broken by id.
pub fn fuse(config: &FusionConfig, vector: &[String], graph: &[String]) -> Vec<Fused> {
    let rrf = |rank: usize, weight: f32| weight / (config.rrf_k + rank as f32 + 1.0);
    let mut scores: HashMap<&str, Fused> = HashMap::new();

    for (rank, id) in vector.iter().enumerate() {
        scores.entry(id).or_insert(Fused {
            id: id.clone(),
            score: rrf(rank, config.vector_weight),
            source: RetrievalSource::Vector,
        });
    }
    for (rank, id) in graph.iter().enumerate() {
        let score = rrf(rank, config.graph_weight);
        scores
            .entry(id)
            .and_modify(|f| {
                if f.source == RetrievalSource::Vector {
                    f.score += score;
                    f.source = RetrievalSource::Both;
                }
            })
            .or_insert(Fused {
                id: id.clone(),
                score,
                source: RetrievalSource::Graph,
            });
    }

    let mut results: Vec<Fused> = scores.into_values().collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    results
}
