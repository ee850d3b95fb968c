//! Ingestion pipeline: source → normalize → embed → index.
//!
//! ```text
//! Idle → Reading → Normalizing → Embedding ⇄ Writing → Done
//!   └──────────────┴─────────────┴──────────┴────────→ Failed
//! ```
//!
//! Documents are processed in batches of `batch_size`. Each batch is
//! embedded with up to `embed_concurrency` requests in flight and no index
//! lock held, then written with a single [`VectorIndex::upsert_batch`], so
//! a batch lands in the index entirely or not at all.
//!
//! Documents whose text cannot be embedded, or whose vector has the wrong
//! length, are recorded as [`DocumentFailure`]s and the run continues.
//! Any [fatal](KbError::is_fatal) error stops the run with
//! [`KbError::IngestAborted`]. Batches committed before the failure stay.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::embedding::{check_dims, Embedder};
use crate::error::{KbError, Result};
use crate::index::VectorIndex;
use crate::models::{DistanceMetric, Document, IndexEntry, IndexSpec, RawRecord};
use crate::normalize::{normalize_at, NormalizeOptions};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_EMBED_CONCURRENCY: usize = 4;

/// Where raw records come from (a parsed file, an HTTP request, a test vector).
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Name used in logs and parse errors.
    fn name(&self) -> String;

    /// Read every record. A failure here means nothing is ingested.
    async fn read(&self) -> Result<Vec<RawRecord>>;
}

#[async_trait]
impl RecordSource for Vec<RawRecord> {
    fn name(&self) -> String {
        "<memory>".to_string()
    }

    async fn read(&self) -> Result<Vec<RawRecord>> {
        Ok(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Reading,
    Normalizing,
    Embedding,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestState::Idle => "idle",
            IngestState::Reading => "reading",
            IngestState::Normalizing => "normalizing",
            IngestState::Embedding => "embedding",
            IngestState::Writing => "writing",
            IngestState::Done => "done",
            IngestState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A document that could not be ingested. The run carried on without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFailure {
    pub source_index: usize,
    pub id: String,
    pub reason: String,
}

impl fmt::Display for DocumentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {} ({}): {}", self.source_index, self.id, self.reason)
    }
}

/// Counters reported after each committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based batch number.
    pub batch: usize,
    pub batches: usize,
    /// Documents written in this batch.
    pub written: usize,
    /// Documents committed so far across the run.
    pub committed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Receives pipeline state transitions and progress.
///
/// All methods default to no-ops.
pub trait IngestObserver: Send + Sync {
    fn on_state(&self, _from: IngestState, _to: IngestState) {}
    fn on_read(&self, _source: &str, _records: usize) {}
    fn on_batch(&self, _progress: &BatchProgress) {}
    fn on_failure(&self, _failure: &DocumentFailure) {}
}

pub struct NoopObserver;

impl IngestObserver for NoopObserver {}

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub embed_concurrency: usize,
    /// Metric used when the pipeline has to create the index.
    pub metric: DistanceMetric,
    pub normalize: NormalizeOptions,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            embed_concurrency: DEFAULT_EMBED_CONCURRENCY,
            metric: DistanceMetric::Cosine,
            normalize: NormalizeOptions::default(),
        }
    }
}

/// Outcome of a run that reached [`IngestState::Done`].
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<DocumentFailure>,
    pub batches: usize,
    pub state: IngestState,
}

impl IngestReport {
    /// `Err(PartialIngestFailure)` when any document failed.
    pub fn into_result(self) -> Result<IngestReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(KbError::PartialIngestFailure {
                succeeded: self.succeeded,
                failed: self.failures.len(),
            })
        }
    }
}

pub struct IngestPipeline<'a> {
    embedder: &'a dyn Embedder,
    index: &'a dyn VectorIndex,
    options: IngestOptions,
    observer: &'a dyn IngestObserver,
    cancel: CancellationToken,
}

struct Run<'a> {
    state: IngestState,
    observer: &'a dyn IngestObserver,
    committed: usize,
    failures: Vec<DocumentFailure>,
}

impl Run<'_> {
    fn enter(&mut self, next: IngestState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "ingest state");
            self.observer.on_state(self.state, next);
            self.state = next;
        }
    }

    fn fail_document(&mut self, doc: &Document, err: &KbError) {
        let failure = DocumentFailure {
            source_index: doc.source_index,
            id: doc.id.clone(),
            reason: err.to_string(),
        };
        warn!(index = failure.source_index, id = %failure.id, reason = %failure.reason, "document skipped");
        self.observer.on_failure(&failure);
        self.failures.push(failure);
    }

    fn abort(&mut self, source: KbError) -> KbError {
        self.enter(IngestState::Failed);
        KbError::IngestAborted {
            committed: self.committed,
            failed: self.failures.len(),
            source: Box::new(source),
        }
    }
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        embedder: &'a dyn Embedder,
        index: &'a dyn VectorIndex,
        options: IngestOptions,
    ) -> Self {
        Self {
            embedder,
            index,
            options,
            observer: &NoopObserver,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn IngestObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn run(&self, source: &dyn RecordSource) -> Result<IngestReport> {
        let mut run = Run {
            state: IngestState::Idle,
            observer: self.observer,
            committed: 0,
            failures: Vec::new(),
        };

        run.enter(IngestState::Reading);
        let records = match source.read().await {
            Ok(records) => records,
            Err(e) => {
                run.enter(IngestState::Failed);
                return Err(e);
            }
        };
        self.observer.on_read(&source.name(), records.len());
        info!(source = %source.name(), records = records.len(), "read records");

        run.enter(IngestState::Normalizing);
        let now = Utc::now();
        let docs: Vec<Document> = records
            .iter()
            .enumerate()
            .map(|(i, raw)| normalize_at(raw, i, &self.options.normalize, now))
            .collect();

        let dims = self.embedder.dims();
        let spec = IndexSpec::new(dims, self.options.metric);
        if let Err(e) = self.index.create(spec).await {
            return Err(run.abort(e));
        }

        let batch_size = self.options.batch_size.max(1);
        let batches = docs.len().div_ceil(batch_size);
        for (b, batch) in docs.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                run.enter(IngestState::Failed);
                info!(committed = run.committed, "ingest cancelled");
                return Err(KbError::Cancelled {
                    committed: run.committed,
                });
            }

            run.enter(IngestState::Embedding);
            let vectors = self.embed_batch(batch).await;

            let mut entries: Vec<IndexEntry> = Vec::with_capacity(batch.len());
            for (doc, result) in batch.iter().zip(vectors) {
                match result.and_then(|v| check_dims(dims, &v).map(|_| v)) {
                    Ok(vector) => entries.push(doc.clone().into_entry(vector)),
                    Err(e) if e.is_fatal() => return Err(run.abort(e)),
                    Err(e) => run.fail_document(doc, &e),
                }
            }

            if self.cancel.is_cancelled() {
                run.enter(IngestState::Failed);
                info!(committed = run.committed, "ingest cancelled, in-flight batch dropped");
                return Err(KbError::Cancelled {
                    committed: run.committed,
                });
            }

            run.enter(IngestState::Writing);
            let written = entries.len();
            if written > 0 {
                if let Err(e) = self.index.upsert_batch(entries).await {
                    return Err(run.abort(e));
                }
            }
            run.committed += written;

            let progress = BatchProgress {
                batch: b + 1,
                batches,
                written,
                committed: run.committed,
                failed: run.failures.len(),
                total: docs.len(),
            };
            debug!(batch = progress.batch, of = batches, written, "batch committed");
            self.observer.on_batch(&progress);
        }

        run.enter(IngestState::Done);
        info!(
            total = docs.len(),
            succeeded = run.committed,
            failed = run.failures.len(),
            "ingest complete"
        );

        Ok(IngestReport {
            total: docs.len(),
            succeeded: run.committed,
            failures: run.failures,
            batches,
            state: IngestState::Done,
        })
    }

    /// Embed one batch, split across up to `embed_concurrency` concurrent
    /// `embed_batch` calls. Output order matches `batch`.
    async fn embed_batch(&self, batch: &[Document]) -> Vec<Result<Vec<f32>>> {
        let concurrency = self.options.embed_concurrency.max(1);
        let group = batch.len().div_ceil(concurrency).max(1);

        // Owned text groups: a closure over borrowed chunks makes the run
        // future `!Send`.
        let groups: Vec<Vec<String>> = batch
            .chunks(group)
            .map(|docs| docs.iter().map(|d| d.embedding_text.clone()).collect())
            .collect();
        let embedder = self.embedder;

        stream::iter(groups)
            .map(move |texts| async move { embedder.embed_batch(&texts).await })
            .buffered(concurrency)
            .flat_map(stream::iter)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{InMemoryIndex, SearchMode};
    use serde_json::json;
    use std::sync::Mutex;

    struct LenEmbedder;

    #[async_trait]
    impl Embedder for LenEmbedder {
        fn model_name(&self) -> &str {
            "len"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                return Err(KbError::Embedding {
                    reason: "poisoned text".into(),
                });
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<IngestState>>);

    impl IngestObserver for Recorder {
        fn on_state(&self, _from: IngestState, to: IngestState) {
            self.0.lock().unwrap().push(to);
        }
    }

    fn records(texts: &[&str]) -> Vec<RawRecord> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| match json!({"id": format!("r{i}"), "content": t}) {
                serde_json::Value::Object(m) => m,
                _ => unreachable!(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_states_and_auto_create() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let observer = Recorder::default();
        let options = IngestOptions {
            batch_size: 2,
            ..Default::default()
        };
        let report = IngestPipeline::new(&LenEmbedder, &index, options)
            .with_observer(&observer)
            .run(&records(&["a", "bb", "ccc"]))
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(index.spec().await.unwrap().unwrap().dimension, 2);
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                IngestState::Reading,
                IngestState::Normalizing,
                IngestState::Embedding,
                IngestState::Writing,
                IngestState::Embedding,
                IngestState::Writing,
                IngestState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_per_document_failure_recorded() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let report = IngestPipeline::new(&LenEmbedder, &index, IngestOptions::default())
            .run(&records(&["ok", "poison", "fine"]))
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].source_index, 1);
        assert_eq!(report.failures[0].id, "r1");
        assert!(matches!(
            report.into_result(),
            Err(KbError::PartialIngestFailure { succeeded: 2, failed: 1 })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_first_batch() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let token = CancellationToken::new();
        token.cancel();
        let err = IngestPipeline::new(&LenEmbedder, &index, IngestOptions::default())
            .with_cancellation(token)
            .run(&records(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::Cancelled { committed: 0 }));
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_existing_index_with_other_dimension_aborts() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        index
            .create(IndexSpec::new(3, DistanceMetric::Cosine))
            .await
            .unwrap();
        index
            .upsert(IndexEntry {
                id: "x".into(),
                vector: vec![1.0, 0.0, 0.0],
                payload: crate::models::Payload {
                    title: None,
                    body: "x".into(),
                    tags: vec![],
                    metadata: Default::default(),
                    extra: Default::default(),
                    import_timestamp: Utc::now(),
                },
            })
            .await
            .unwrap();

        let err = IngestPipeline::new(&LenEmbedder, &index, IngestOptions::default())
            .run(&records(&["a"]))
            .await
            .unwrap_err();
        match err {
            KbError::IngestAborted { committed, source, .. } => {
                assert_eq!(committed, 0);
                assert!(matches!(*source, KbError::DimensionMismatch { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Fails every call once `healthy` calls have gone through.
    struct FlakyEmbedder {
        healthy: usize,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls > self.healthy {
                return Err(KbError::EmbeddingUnavailable {
                    model: "flaky".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    #[tokio::test]
    async fn test_unreachable_embedder_keeps_committed_batches() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let observer = Recorder::default();
        let embedder = FlakyEmbedder {
            healthy: 2,
            calls: Mutex::new(0),
        };
        let options = IngestOptions {
            batch_size: 2,
            embed_concurrency: 1,
            ..Default::default()
        };
        let err = IngestPipeline::new(&embedder, &index, options)
            .with_observer(&observer)
            .run(&records(&["a", "bb", "ccc", "dddd"]))
            .await
            .unwrap_err();

        match err {
            KbError::IngestAborted {
                committed,
                failed,
                source,
            } => {
                assert_eq!(committed, 2);
                assert_eq!(failed, 0);
                assert!(matches!(*source, KbError::EmbeddingUnavailable { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(observer.0.lock().unwrap().last(), Some(&IngestState::Failed));
        assert_eq!(index.count().await.unwrap(), 2);
        let mut ids: Vec<String> = index
            .scroll(None, 10)
            .await
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["r0", "r1"]);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_is_send() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let source = records(&["a"]);
        let pipeline = IngestPipeline::new(&LenEmbedder, &index, IngestOptions::default());
        let fut = pipeline.run(&source);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn test_empty_source_creates_index() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let report = IngestPipeline::new(&LenEmbedder, &index, IngestOptions::default())
            .run(&Vec::<RawRecord>::new())
            .await
            .unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.batches, 0);
        assert!(index.exists().await.unwrap());
    }
}
