//! In-memory [`VectorIndex`] implementation.
//!
//! All state sits behind a single `std::sync::RwLock`: writes take it
//! exclusively and queries share it, so a query sees a batch either
//! entirely or not at all. Nothing is persisted.
//!
//! Two search modes are available. [`SearchMode::Exact`] scans every
//! vector and serves as the correctness oracle. [`SearchMode::Hnsw`]
//! answers from an [`HnswGraph`] and falls back to a scan when
//! tombstones leave the graph short of `k` live results.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::embedding::check_dims;
use crate::error::{KbError, Result};
use crate::models::{IndexEntry, IndexSpec, RawHit, ScrollCursor, ScrollPage};

use super::hnsw::{HnswGraph, HnswParams};
use super::{reconcile_spec, sort_and_truncate, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Exact,
    Hnsw(HnswParams),
}

#[derive(Default)]
struct State {
    spec: Option<IndexSpec>,
    next_seq: u64,
    by_id: HashMap<String, u64>,
    entries: BTreeMap<u64, IndexEntry>,
    graph: Option<HnswGraph>,
}

impl State {
    fn require_spec(&self, name: &str) -> Result<IndexSpec> {
        self.spec.ok_or_else(|| KbError::IndexNotFound(name.to_string()))
    }

    fn rebuild_graph(&mut self, mode: SearchMode) {
        self.graph = match (mode, self.spec) {
            (SearchMode::Hnsw(params), Some(spec)) => {
                let mut graph = HnswGraph::new(params, spec.metric);
                for (seq, entry) in &self.entries {
                    graph.insert(*seq, entry.vector.clone());
                }
                Some(graph)
            }
            _ => None,
        };
    }

    fn remove_seq(&mut self, seq: u64) -> Option<IndexEntry> {
        if let Some(graph) = self.graph.as_mut() {
            graph.remove(seq);
        }
        self.entries.remove(&seq)
    }

    fn scan(&self, spec: IndexSpec, vector: &[f32]) -> Vec<RawHit> {
        self.entries
            .iter()
            .map(|(seq, entry)| RawHit {
                id: entry.id.clone(),
                distance: spec.metric.distance(vector, &entry.vector),
                seq: *seq,
                payload: entry.payload.clone(),
            })
            .collect()
    }
}

/// Non-durable vector index for tests, demos, and the `memory` backend.
pub struct InMemoryIndex {
    name: String,
    mode: SearchMode,
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new(name: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            name: name.into(),
            mode,
            state: RwLock::new(State::default()),
        }
    }

    /// An index that has already been created with `spec`.
    pub fn with_spec(name: impl Into<String>, mode: SearchMode, spec: IndexSpec) -> Self {
        let mut state = State {
            spec: Some(spec),
            ..State::default()
        };
        state.rebuild_graph(mode);
        Self {
            name: name.into(),
            mode,
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| KbError::storage("memory", &self.name, "index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| KbError::storage("memory", &self.name, "index lock poisoned"))
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn backend(&self) -> &str {
        "memory"
    }

    fn target(&self) -> String {
        self.name.clone()
    }

    async fn create(&self, spec: IndexSpec) -> Result<()> {
        let mut state = self.write()?;
        match state.spec {
            None => {
                state.spec = Some(spec);
                state.rebuild_graph(self.mode);
            }
            Some(existing) => {
                let populated = !state.entries.is_empty();
                if !reconcile_spec(existing, spec, populated)? {
                    debug!(index = %self.name, from = ?existing, to = ?spec, "replacing spec of empty index");
                    state.spec = Some(spec);
                    state.rebuild_graph(self.mode);
                }
            }
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.read()?.spec.is_some())
    }

    async fn spec(&self) -> Result<Option<IndexSpec>> {
        Ok(self.read()?.spec)
    }

    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<()> {
        let mut state = self.write()?;
        let spec = state.require_spec(&self.name)?;
        for entry in &entries {
            check_dims(spec.dimension, &entry.vector)?;
        }

        for entry in entries {
            if let Some(old) = state.by_id.get(&entry.id).copied() {
                state.remove_seq(old);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.by_id.insert(entry.id.clone(), seq);
            if let Some(graph) = state.graph.as_mut() {
                graph.insert(seq, entry.vector.clone());
            }
            state.entries.insert(seq, entry);
        }

        if state.graph.as_ref().is_some_and(HnswGraph::needs_rebuild) {
            debug!(index = %self.name, "compacting hnsw graph");
            state.rebuild_graph(self.mode);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        let Some(seq) = state.by_id.remove(id) else {
            return Ok(false);
        };
        state.remove_seq(seq);
        Ok(true)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RawHit>> {
        let state = self.read()?;
        let spec = state.require_spec(&self.name)?;
        check_dims(spec.dimension, vector)?;
        if state.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut hits = match &state.graph {
            Some(graph) => {
                let approx: Vec<RawHit> = graph
                    .search(vector, k)
                    .into_iter()
                    .filter_map(|(seq, _)| {
                        state.entries.get(&seq).map(|entry| RawHit {
                            id: entry.id.clone(),
                            distance: spec.metric.distance(vector, &entry.vector),
                            seq,
                            payload: entry.payload.clone(),
                        })
                    })
                    .collect();
                if approx.len() < k.min(state.entries.len()) {
                    debug!(index = %self.name, got = approx.len(), k, "hnsw short of k, scanning");
                    state.scan(spec, vector)
                } else {
                    approx
                }
            }
            None => state.scan(spec, vector),
        };

        sort_and_truncate(&mut hits, k);
        Ok(hits)
    }

    async fn scroll(&self, cursor: Option<ScrollCursor>, limit: usize) -> Result<ScrollPage> {
        let state = self.read()?;
        state.require_spec(&self.name)?;

        let lower = match cursor {
            Some(c) => Bound::Excluded(c.last_seq()),
            None => Bound::Unbounded,
        };
        let mut range = state.entries.range((lower, Bound::Unbounded));
        let mut entries = Vec::with_capacity(limit.min(state.entries.len()));
        let mut last = None;
        for (seq, entry) in range.by_ref().take(limit) {
            entries.push(entry.clone());
            last = Some(*seq);
        }
        let next_cursor = match (last, range.next()) {
            (Some(seq), Some(_)) => Some(ScrollCursor::after(seq)),
            _ => None,
        };
        Ok(ScrollPage {
            entries,
            next_cursor,
        })
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }
}
