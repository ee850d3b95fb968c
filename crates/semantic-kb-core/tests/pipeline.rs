//! End-to-end pipeline tests against the in-memory index.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use semantic_kb_core::embedding::{l2_normalize, Embedder};
use semantic_kb_core::index::hnsw::HnswParams;
use semantic_kb_core::index::memory::{InMemoryIndex, SearchMode};
use semantic_kb_core::index::VectorIndex;
use semantic_kb_core::ingest::{
    BatchProgress, CancellationToken, IngestObserver, IngestOptions, IngestPipeline,
};
use semantic_kb_core::models::{DistanceMetric, IndexEntry, IndexSpec, Payload, RawRecord};
use semantic_kb_core::query::{QueryPipeline, DEFAULT_LIMIT};
use semantic_kb_core::rank::RankOptions;
use semantic_kb_core::KbError;

/// Maps known words onto a handful of concept axes.
struct ConceptEmbedder;

const AXES: &[&[&str]] = &[
    &["apple", "banana", "fruit", "cherry"],
    &["pie", "dessert", "cake", "tart"],
    &["smoothie", "drink", "juice"],
];

#[async_trait]
impl Embedder for ConceptEmbedder {
    fn model_name(&self) -> &str {
        "concept"
    }

    fn dims(&self) -> usize {
        AXES.len() + 1
    }

    async fn embed(&self, text: &str) -> semantic_kb_core::Result<Vec<f32>> {
        if text.contains("unembeddable") {
            return Err(KbError::Embedding {
                reason: "model rejected input".into(),
            });
        }
        let mut v = vec![0.0f32; self.dims()];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            match AXES.iter().position(|axis| axis.contains(&word.as_str())) {
                Some(axis) => v[axis] += 1.0,
                None => v[AXES.len()] += 0.25,
            }
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        _ => panic!("record must be an object"),
    }
}

fn entry(id: &str, vector: Vec<f32>) -> IndexEntry {
    IndexEntry {
        id: id.into(),
        vector,
        payload: Payload {
            title: None,
            body: id.into(),
            tags: vec![],
            metadata: Default::default(),
            extra: Default::default(),
            import_timestamp: chrono::Utc::now(),
        },
    }
}

#[tokio::test]
async fn test_round_trip_top1() {
    let index = InMemoryIndex::new("kb", SearchMode::Exact);
    let records = vec![
        record(json!({"id": "a", "title": "A", "content": "apple pie recipe"})),
        record(json!({"id": "b", "title": "B", "content": "banana smoothie"})),
        record(json!({"id": "c", "content": "cherry tart with extra cream"})),
    ];
    IngestPipeline::new(&ConceptEmbedder, &index, IngestOptions::default())
        .run(&records)
        .await
        .unwrap();

    let query = QueryPipeline::new(&ConceptEmbedder, &index, RankOptions::default());
    let results = query.search("B\n\nbanana smoothie", DEFAULT_LIMIT).await.unwrap();
    assert_eq!(results[0].id, "b");
    assert!((results[0].similarity - 100.0).abs() < 1e-3);
    assert_eq!(results[0].payload.title.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_dessert_with_fruit_orders_by_cosine() {
    let index = InMemoryIndex::new("kb", SearchMode::Exact);
    let records = vec![
        record(json!({"id": "A", "content": "apple pie recipe"})),
        record(json!({"id": "B", "content": "banana smoothie"})),
    ];
    IngestPipeline::new(&ConceptEmbedder, &index, IngestOptions::default())
        .run(&records)
        .await
        .unwrap();

    let results = QueryPipeline::new(&ConceptEmbedder, &index, RankOptions::default())
        .search("dessert with fruit", DEFAULT_LIMIT)
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "A");
    assert_eq!(results[1].id, "B");
    assert!(results[0].similarity > results[1].similarity);
    assert_eq!(results[0].rank, 1);
}

#[tokio::test]
async fn test_batch_partial_failure() {
    let index = InMemoryIndex::new("kb", SearchMode::Exact);
    let records: Vec<RawRecord> = (0..10)
        .map(|i| {
            let text = if i == 5 { "unembeddable" } else { "apple" };
            record(json!({"id": format!("d{i}"), "content": text}))
        })
        .collect();

    let report = IngestPipeline::new(&ConceptEmbedder, &index, IngestOptions::default())
        .run(&records)
        .await
        .unwrap();

    assert_eq!(report.total, 10);
    assert_eq!(report.succeeded, 9);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].source_index, 5);
    assert_eq!(report.failures[0].id, "d5");
    assert_eq!(index.count().await.unwrap(), 9);
}

#[tokio::test]
async fn test_empty_index_query_is_empty() {
    let index = InMemoryIndex::new("kb", SearchMode::Exact);
    IngestPipeline::new(&ConceptEmbedder, &index, IngestOptions::default())
        .run(&Vec::<RawRecord>::new())
        .await
        .unwrap();

    let results = QueryPipeline::new(&ConceptEmbedder, &index, RankOptions::default())
        .search("apple", DEFAULT_LIMIT)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_reingest_with_external_ids_is_idempotent() {
    let index = InMemoryIndex::new("kb", SearchMode::Exact);
    let records = vec![
        record(json!({"id": "a", "content": "apple"})),
        record(json!({"id": "b", "content": "banana"})),
    ];
    let pipeline = IngestPipeline::new(&ConceptEmbedder, &index, IngestOptions::default());
    pipeline.run(&records).await.unwrap();
    pipeline.run(&records).await.unwrap();
    assert_eq!(index.count().await.unwrap(), 2);
}

struct CancelAfterFirst(CancellationToken);

impl IngestObserver for CancelAfterFirst {
    fn on_batch(&self, progress: &BatchProgress) {
        if progress.batch == 1 {
            self.0.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancellation_keeps_whole_batches() {
    let index = InMemoryIndex::new("kb", SearchMode::Exact);
    let token = CancellationToken::new();
    let observer = CancelAfterFirst(token.clone());
    let records: Vec<RawRecord> = (0..9)
        .map(|i| record(json!({"id": i, "content": "cherry cake"})))
        .collect();
    let options = IngestOptions {
        batch_size: 3,
        ..Default::default()
    };

    let err = IngestPipeline::new(&ConceptEmbedder, &index, options)
        .with_observer(&observer)
        .with_cancellation(token)
        .run(&records)
        .await
        .unwrap_err();

    assert!(matches!(err, KbError::Cancelled { committed: 3 }));
    assert_eq!(index.count().await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_partial_batches() {
    let index = Arc::new(InMemoryIndex::with_spec(
        "kb",
        SearchMode::Exact,
        IndexSpec::new(2, DistanceMetric::Cosine),
    ));
    let batch = 5;

    let writer = {
        let index = index.clone();
        tokio::spawn(async move {
            for b in 0..40 {
                let entries = (0..batch)
                    .map(|i| entry(&format!("{b}-{i}"), vec![1.0, i as f32]))
                    .collect();
                index.upsert_batch(entries).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let reader = {
        let index = index.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let n = index.count().await.unwrap();
                assert_eq!(n % batch, 0, "observed torn batch: {n}");
                let hits = index.query(&[1.0, 0.0], 1000).await.unwrap();
                assert_eq!(hits.len() % batch, 0);
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
    assert_eq!(index.count().await.unwrap(), 200);
}

#[tokio::test]
async fn test_hnsw_index_recall_with_deletes() {
    let exact = InMemoryIndex::with_spec("exact", SearchMode::Exact, IndexSpec::new(8, DistanceMetric::Cosine));
    let hnsw = InMemoryIndex::with_spec(
        "hnsw",
        SearchMode::Hnsw(HnswParams::default()),
        IndexSpec::new(8, DistanceMetric::Cosine),
    );

    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % 2000) as f32 / 1000.0 - 1.0
    };

    for i in 0..600 {
        let v: Vec<f32> = (0..8).map(|_| next()).collect();
        exact.upsert(entry(&format!("v{i}"), v.clone())).await.unwrap();
        hnsw.upsert(entry(&format!("v{i}"), v)).await.unwrap();
    }
    for i in (0..600).step_by(7) {
        exact.delete(&format!("v{i}")).await.unwrap();
        hnsw.delete(&format!("v{i}")).await.unwrap();
    }

    let k = 10;
    let mut found = 0;
    for _ in 0..30 {
        let q: Vec<f32> = (0..8).map(|_| next()).collect();
        let truth: HashSet<String> = exact
            .query(&q, k)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        let approx = hnsw.query(&q, k).await.unwrap();
        assert!(approx.windows(2).all(|w| w[0].distance <= w[1].distance));
        found += approx.iter().filter(|h| truth.contains(&h.id)).count();
    }
    let recall = found as f64 / (30 * k) as f64;
    assert!(recall >= 0.9, "recall {recall}");
}
