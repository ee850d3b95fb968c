//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only storage contract the pipelines
//! depend on. Backends (in-memory here, SQLite in the application crate)
//! are interchangeable behind it.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod hnsw;
pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::{KbError, Result};
use crate::models::{IndexEntry, IndexSpec, RawHit, ScrollCursor, ScrollPage};

/// Storage and k-NN query engine for `(id, vector, payload)` triples.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create`](VectorIndex::create) | Declare dimension and metric (idempotent) |
/// | [`exists`](VectorIndex::exists) | Whether `create` has been called |
/// | [`spec`](VectorIndex::spec) | Current dimension and metric |
/// | [`upsert`](VectorIndex::upsert) | Insert or replace one entry |
/// | [`upsert_batch`](VectorIndex::upsert_batch) | Insert or replace a set of entries atomically |
/// | [`delete`](VectorIndex::delete) | Remove an entry (no-op if absent) |
/// | [`query`](VectorIndex::query) | k nearest neighbors, closest first |
/// | [`scroll`](VectorIndex::scroll) | Enumerate entries in insertion order |
/// | [`count`](VectorIndex::count) | Number of live entries |
///
/// # Consistency
///
/// A successful `upsert`/`upsert_batch` is visible to every subsequent
/// `query`. A query never observes part of a batch. Replacing an entry
/// gives it a new insertion sequence, as if deleted and reinserted.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend identifier used in logs and errors (`"memory"`, `"sqlite"`).
    fn backend(&self) -> &str;

    /// Human-readable location of the index (collection name, file path).
    fn target(&self) -> String;

    /// Create the index, or confirm an existing one matches `spec`.
    ///
    /// An existing index that holds entries under a different dimension
    /// or metric is rejected. An existing empty index adopts `spec`.
    async fn create(&self, spec: IndexSpec) -> Result<()>;

    async fn exists(&self) -> Result<bool>;

    async fn spec(&self) -> Result<Option<IndexSpec>>;

    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        self.upsert_batch(vec![entry]).await
    }

    /// Validate every entry, then apply all of them or none.
    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Returns whether an entry was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RawHit>>;

    /// Return up to `limit` entries after `cursor` in insertion order.
    async fn scroll(&self, cursor: Option<ScrollCursor>, limit: usize) -> Result<ScrollPage>;

    async fn count(&self) -> Result<usize>;
}

/// Check a requested spec against the one an index already has.
///
/// Returns `Ok(true)` when the existing spec can simply be kept and
/// `Ok(false)` when the index is empty and may adopt `requested`.
pub fn reconcile_spec(existing: IndexSpec, requested: IndexSpec, populated: bool) -> Result<bool> {
    if existing == requested {
        return Ok(true);
    }
    if !populated {
        return Ok(false);
    }
    if existing.dimension != requested.dimension {
        return Err(KbError::DimensionMismatch {
            expected: existing.dimension,
            actual: requested.dimension,
        });
    }
    Err(KbError::MetricMismatch {
        expected: existing.metric,
        actual: requested.metric,
    })
}

/// Closest first; equal distances fall back to insertion order, then id.
pub fn hit_order(a: &RawHit, b: &RawHit) -> Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(Ordering::Equal)
        .then(a.seq.cmp(&b.seq))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort hits with [`hit_order`] and keep the first `k`.
pub fn sort_and_truncate(hits: &mut Vec<RawHit>, k: usize) {
    hits.sort_by(hit_order);
    hits.truncate(k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DistanceMetric, Payload};

    fn hit(id: &str, distance: f32, seq: u64) -> RawHit {
        RawHit {
            id: id.into(),
            distance,
            seq,
            payload: Payload {
                title: None,
                body: id.into(),
                tags: vec![],
                metadata: Default::default(),
                extra: Default::default(),
                import_timestamp: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn test_hit_order_ties_by_seq() {
        let mut hits = vec![hit("b", 0.1, 5), hit("a", 0.1, 2), hit("c", 0.0, 9)];
        sort_and_truncate(&mut hits, 10);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_sort_and_truncate_keeps_k() {
        let mut hits = vec![hit("a", 0.3, 0), hit("b", 0.2, 1), hit("c", 0.1, 2)];
        sort_and_truncate(&mut hits, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "c");
    }

    #[test]
    fn test_reconcile_spec() {
        let cos3 = IndexSpec::new(3, DistanceMetric::Cosine);
        let cos4 = IndexSpec::new(4, DistanceMetric::Cosine);
        let dot3 = IndexSpec::new(3, DistanceMetric::Dot);

        assert!(reconcile_spec(cos3, cos3, true).unwrap());
        assert!(!reconcile_spec(cos3, cos4, false).unwrap());
        assert!(matches!(
            reconcile_spec(cos3, cos4, true),
            Err(KbError::DimensionMismatch { expected: 3, actual: 4 })
        ));
        assert!(matches!(
            reconcile_spec(cos3, dot3, true),
            Err(KbError::MetricMismatch { .. })
        ));
    }
}
