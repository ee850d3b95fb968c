//! Hierarchical Navigable Small World graph for approximate k-NN.
//!
//! The graph owns a copy of every inserted vector, keyed by the caller's
//! insertion sequence. Deletes are tombstones: the node keeps routing
//! traffic but is never returned. Callers rebuild the graph once
//! tombstones outnumber live nodes (see [`HnswGraph::needs_rebuild`]).
//!
//! Level assignment is a pure function of the key, so building the same
//! sequence of inserts always yields the same graph.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::models::DistanceMetric;

const MAX_LEVEL: usize = 16;

/// Graph construction and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Links per node on upper layers; layer 0 allows `2 * m`.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            ef_search: 64,
        }
    }
}

struct Node {
    key: u64,
    vector: Vec<f32>,
    /// `links[layer]` for every layer `0..=level`.
    links: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    node: usize,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct HnswGraph {
    params: HnswParams,
    metric: DistanceMetric,
    level_mult: f64,
    nodes: Vec<Node>,
    by_key: HashMap<u64, usize>,
    entry_point: Option<usize>,
    max_level: usize,
    tombstones: usize,
}

impl HnswGraph {
    pub fn new(params: HnswParams, metric: DistanceMetric) -> Self {
        let m = params.m.max(2);
        Self {
            params: HnswParams { m, ..params },
            metric,
            level_mult: 1.0 / (m as f64).ln(),
            nodes: Vec::new(),
            by_key: HashMap::new(),
            entry_point: None,
            max_level: 0,
            tombstones: 0,
        }
    }

    /// Number of nodes that can still be returned.
    pub fn live(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    pub fn needs_rebuild(&self) -> bool {
        self.tombstones > 32 && self.tombstones > self.live()
    }

    /// Top layer a key is assigned to.
    ///
    /// Draws a uniform `u` in `(0, 1]` from a SHA-256 of the key and
    /// returns `floor(-ln(u) / ln(m))`, the usual exponential decay.
    pub fn level_for(&self, key: u64) -> usize {
        let digest = Sha256::digest(key.to_le_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let bits = u64::from_le_bytes(bytes) >> 11;
        let unit = (bits as f64 + 1.0) / (1u64 << 53) as f64;
        let level = (-unit.ln() * self.level_mult).floor() as usize;
        level.min(MAX_LEVEL)
    }

    pub fn insert(&mut self, key: u64, vector: Vec<f32>) {
        if let Some(&existing) = self.by_key.get(&key) {
            if !self.nodes[existing].deleted {
                self.nodes[existing].deleted = true;
                self.tombstones += 1;
            }
        }

        let level = self.level_for(key);
        let idx = self.nodes.len();
        self.nodes.push(Node {
            key,
            vector,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.by_key.insert(key, idx);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(idx);
            self.max_level = level;
            return;
        };

        let query = self.nodes[idx].vector.clone();
        let mut current = entry;
        for layer in ((level + 1)..=self.max_level).rev() {
            current = self.greedy_closest(&query, current, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates =
                self.search_layer(&query, &[current], self.params.ef_construction, layer);
            let cap = self.layer_capacity(layer);
            let neighbors: Vec<usize> = candidates
                .iter()
                .filter(|s| s.node != idx)
                .take(cap)
                .map(|s| s.node)
                .collect();

            for &neighbor in &neighbors {
                self.nodes[neighbor].links[layer].push(idx);
                if self.nodes[neighbor].links[layer].len() > cap {
                    self.prune(neighbor, layer, cap);
                }
            }
            self.nodes[idx].links[layer] = neighbors;

            if let Some(best) = candidates.first() {
                current = best.node;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(idx);
        }
    }

    /// Tombstone `key`. Returns whether a live node was marked.
    pub fn remove(&mut self, key: u64) -> bool {
        match self.by_key.remove(&key) {
            Some(idx) if !self.nodes[idx].deleted => {
                self.nodes[idx].deleted = true;
                self.tombstones += 1;
                true
            }
            _ => false,
        }
    }

    /// Up to `k` live `(key, distance)` pairs, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut current = entry;
        for layer in (1..=self.max_level).rev() {
            current = self.greedy_closest(query, current, layer);
        }

        let ef = self.params.ef_search.max(k);
        self.search_layer(query, &[current], ef, 0)
            .into_iter()
            .filter(|s| !self.nodes[s.node].deleted)
            .take(k)
            .map(|s| (self.nodes[s.node].key, s.distance))
            .collect()
    }

    fn layer_capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn distance_to(&self, query: &[f32], node: usize) -> f32 {
        self.metric.distance(query, &self.nodes[node].vector)
    }

    fn greedy_closest(&self, query: &[f32], start: usize, layer: usize) -> usize {
        self.search_layer(query, &[start], 1, layer)
            .first()
            .map(|s| s.node)
            .unwrap_or(start)
    }

    /// Best-first beam search on one layer. Result is sorted closest first.
    fn search_layer(&self, query: &[f32], entry: &[usize], ef: usize, layer: usize) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited: HashSet<usize> = entry.iter().copied().collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &node in entry {
            let scored = Scored {
                distance: self.distance_to(query, node),
                node,
            };
            candidates.push(Reverse(scored));
            results.push(scored);
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.distance > worst.distance {
                    break;
                }
            }
            let Some(links) = self.nodes[current.node].links.get(layer) else {
                continue;
            };
            for &next in links {
                if !visited.insert(next) {
                    continue;
                }
                let scored = Scored {
                    distance: self.distance_to(query, next),
                    node: next,
                };
                let admit = results.len() < ef
                    || results.peek().map_or(true, |w| scored.distance < w.distance);
                if admit {
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn prune(&mut self, node: usize, layer: usize, cap: usize) {
        let base = self.nodes[node].vector.clone();
        let mut scored: Vec<Scored> = self.nodes[node].links[layer]
            .iter()
            .map(|&n| Scored {
                distance: self.metric.distance(&base, &self.nodes[n].vector),
                node: n,
            })
            .collect();
        scored.sort();
        scored.truncate(cap);
        self.nodes[node].links[layer] = scored.into_iter().map(|s| s.node).collect();
    }
}
