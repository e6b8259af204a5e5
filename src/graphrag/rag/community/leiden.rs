//! Leiden Community Detection Algorithm
//!
//! Hierarchical community detection over the entity graph. Each level runs
//! seeded local moving (modularity gain with a resolution parameter) followed
//! by a connectivity refinement that splits any community whose members are
//! not connected inside it. Communities larger than `max_cluster_size` are
//! re-clustered on their induced subgraph to form the next level.
//!
//! Determinism: nodes are sorted by entity id, then shuffled with a `StdRng`
//! seeded from the configured seed; ties between candidate communities go to
//! the smallest label. The same graph and seed always yield the same forest.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::graphrag::domain::{Community, Entity, Relationship};

// =============================================================================
// Leiden Community Detector
// =============================================================================

/// Parameters for community detection.
#[derive(Debug, Clone)]
pub struct LeidenConfig {
    /// Resolution parameter (higher = smaller communities)
    pub resolution: f64,
    /// Maximum local moving sweeps per level
    pub max_iterations: usize,
    /// Communities above this size are subdivided
    pub max_cluster_size: usize,
    /// Random seed for reproducibility; `None` draws one from the OS
    pub seed: Option<u64>,
    /// Hard cap on hierarchy depth
    pub max_levels: u32,
}

impl Default for LeidenConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 20,
            max_cluster_size: 10,
            seed: Some(0xDEAD_BEEF),
            max_levels: 8,
        }
    }
}

impl LeidenConfig {
    pub fn from_app(config: &crate::config::AppConfig) -> Self {
        Self {
            resolution: config.community.resolution,
            max_iterations: config.community.max_iterations,
            max_cluster_size: config.community.max_cluster_size,
            seed: config.community.seed,
            ..Self::default()
        }
    }
}

/// Community detector using the Leiden algorithm.
#[derive(Debug)]
pub struct LeidenCommunityDetector {
    config: LeidenConfig,
}

impl LeidenCommunityDetector {
    /// Create with custom configuration.
    pub fn with_config(config: LeidenConfig) -> Self {
        Self { config }
    }

    /// Detect a hierarchy of communities. Only entities that take part in at
    /// least one relationship are clustered.
    pub fn detect_communities(
        &self,
        entities: &[Entity],
        relationships: &[Relationship],
    ) -> Vec<Community> {
        let known: BTreeSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        let mut edges: BTreeMap<(String, String), f64> = BTreeMap::new();
        for rel in relationships {
            if rel.source_id == rel.target_id
                || !known.contains(rel.source_id.as_str())
                || !known.contains(rel.target_id.as_str())
            {
                continue;
            }
            let pair = if rel.source_id <= rel.target_id {
                (rel.source_id.clone(), rel.target_id.clone())
            } else {
                (rel.target_id.clone(), rel.source_id.clone())
            };
            *edges.entry(pair).or_default() += rel.weight.max(f64::MIN_POSITIVE);
        }
        let nodes: BTreeSet<String> = edges
            .keys()
            .flat_map(|(a, b)| [a.clone(), b.clone()])
            .collect();
        if nodes.is_empty() {
            return Vec::new();
        }

        let base_seed = match self.config.seed {
            Some(seed) => seed,
            None => rand::random(),
        };

        let mut result: Vec<Community> = Vec::new();

        // Level 0 partitions the whole graph.
        let roots = self.partition(&nodes, &edges, base_seed, self.config.resolution);
        let mut frontier = assign_ids(0, roots.into_iter().map(|m| (None, m)).collect());

        let mut level = 0;
        loop {
            let mut next: Vec<(Option<String>, Vec<String>)> = Vec::new();
            if level + 1 < self.config.max_levels {
                for community in &frontier {
                    if community.member_entity_ids.len() <= self.config.max_cluster_size {
                        continue;
                    }
                    if let Some(children) = self.subdivide(community, &edges, base_seed) {
                        next.extend(children.into_iter().map(|m| (Some(community.id.clone()), m)));
                    }
                }
            }

            let children = assign_ids(level + 1, next);
            for child in &children {
                if let Some(parent) = child
                    .parent_community_id
                    .as_ref()
                    .and_then(|p| frontier.iter_mut().find(|c| &c.id == p))
                {
                    parent.child_community_ids.push(child.id.clone());
                }
            }
            result.append(&mut frontier);
            if children.is_empty() {
                break;
            }
            frontier = children;
            level += 1;
        }

        tracing::info!(
            communities = result.len(),
            levels = level + 1,
            nodes = nodes.len(),
            "Leiden detected communities"
        );
        result
    }

    /// Split an oversized community on its induced subgraph. Resolution is
    /// doubled up to three times if the first attempt keeps it whole;
    /// `None` means it cannot be split and stays a leaf.
    fn subdivide(
        &self,
        community: &Community,
        edges: &BTreeMap<(String, String), f64>,
        base_seed: u64,
    ) -> Option<Vec<Vec<String>>> {
        let members: BTreeSet<String> = community.member_entity_ids.iter().cloned().collect();
        let induced: BTreeMap<(String, String), f64> = edges
            .iter()
            .filter(|((a, b), _)| members.contains(a) && members.contains(b))
            .map(|(k, w)| (k.clone(), *w))
            .collect();
        let seed = mix_seed(base_seed, &community.id);

        let mut resolution = self.config.resolution;
        for _ in 0..4 {
            let parts = self.partition(&members, &induced, seed, resolution);
            if parts.len() > 1 {
                return Some(parts);
            }
            resolution *= 2.0;
        }
        None
    }

    /// One level of local moving plus refinement over `nodes`.
    fn partition(
        &self,
        nodes: &BTreeSet<String>,
        edges: &BTreeMap<(String, String), f64>,
        seed: u64,
        resolution: f64,
    ) -> Vec<Vec<String>> {
        let (graph, ids) = build_graph(nodes, edges);
        let n = graph.node_count();
        let degree: Vec<f64> = graph
            .node_indices()
            .map(|v| graph.edges(v).map(|e| *e.weight()).sum())
            .collect();
        let two_m: f64 = degree.iter().sum();

        let mut label: Vec<usize> = (0..n).collect();
        if two_m > 0.0 {
            let mut totals: Vec<f64> = degree.clone();
            let mut order: Vec<usize> = (0..n).collect();
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);

            for _ in 0..self.config.max_iterations {
                let mut moved = false;
                for &v in &order {
                    let current = label[v];
                    let k_v = degree[v];

                    let mut links: BTreeMap<usize, f64> = BTreeMap::new();
                    for edge in graph.edges(NodeIndex::new(v)) {
                        let u = other_end(&edge, v);
                        if u != v {
                            *links.entry(label[u]).or_default() += *edge.weight();
                        }
                    }

                    // Take v out of its community before evaluating gains.
                    totals[current] -= k_v;
                    let gain = |c: usize, k_in: f64| k_in - resolution * totals[c] * k_v / two_m;
                    let mut best = current;
                    let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
                    // Ascending label order plus a strict comparison sends
                    // ties to the smallest label.
                    for (&c, &k_in) in &links {
                        let g = gain(c, k_in);
                        if c != current && g > best_gain + 1e-12 {
                            best = c;
                            best_gain = g;
                        }
                    }
                    totals[best] += k_v;
                    if best != current {
                        label[v] = best;
                        moved = true;
                    }
                }
                if !moved {
                    break;
                }
            }
        }

        refine(&graph, &label, &ids)
    }
}

/// Split each community into its connected components and return member
/// lists sorted by id.
fn refine(graph: &UnGraph<String, f64>, label: &[usize], ids: &[String]) -> Vec<Vec<String>> {
    let mut seen = vec![false; label.len()];
    let mut parts = Vec::new();
    for start in 0..label.len() {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut members = Vec::new();
        while let Some(v) = queue.pop_front() {
            members.push(ids[v].clone());
            for edge in graph.edges(NodeIndex::new(v)) {
                let u = other_end(&edge, v);
                if !seen[u] && label[u] == label[start] {
                    seen[u] = true;
                    queue.push_back(u);
                }
            }
        }
        members.sort();
        parts.push(members);
    }
    parts
}

fn other_end(edge: &petgraph::graph::EdgeReference<'_, f64>, v: usize) -> usize {
    if edge.source().index() == v {
        edge.target().index()
    } else {
        edge.source().index()
    }
}

/// Build an undirected petgraph graph with nodes in id order.
fn build_graph(
    nodes: &BTreeSet<String>,
    edges: &BTreeMap<(String, String), f64>,
) -> (UnGraph<String, f64>, Vec<String>) {
    let mut graph = UnGraph::new_undirected();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    let mut ids = Vec::with_capacity(nodes.len());
    for id in nodes {
        index.insert(id.as_str(), graph.add_node(id.clone()));
        ids.push(id.clone());
    }
    for ((a, b), w) in edges {
        if let (Some(&x), Some(&y)) = (index.get(a.as_str()), index.get(b.as_str())) {
            graph.add_edge(x, y, *w);
        }
    }
    (graph, ids)
}

/// Order member lists by smallest member and give them `<level>-<ordinal>` ids.
fn assign_ids(level: u32, mut groups: Vec<(Option<String>, Vec<String>)>) -> Vec<Community> {
    groups.sort_by(|a, b| a.1.first().cmp(&b.1.first()));
    groups
        .into_iter()
        .enumerate()
        .map(|(ordinal, (parent, members))| Community {
            id: format!("{level}-{ordinal}"),
            level,
            member_entity_ids: members,
            parent_community_id: parent,
            child_community_ids: Vec::new(),
        })
        .collect()
}

/// FNV-1a over the community id, folded into the base seed.
fn mix_seed(seed: u64, id: &str) -> u64 {
    id.bytes().fold(seed ^ 0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

// =============================================================================
// Tests
// =============================================================================
