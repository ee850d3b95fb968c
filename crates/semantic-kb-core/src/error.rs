//! Error kinds shared by every layer of the engine.
//!
//! Per-document failures (`Embedding`, `DimensionMismatch` on a single
//! entry) are collected by the ingest pipeline and reported after the
//! batch. Everything [`KbError::is_fatal`] returns `true` for aborts the
//! run. The core never retries; retry policy belongs to the caller.

use thiserror::Error;

use crate::models::DistanceMetric;

#[derive(Debug, Error)]
pub enum KbError {
    /// The input could not be parsed at all. Nothing was ingested.
    #[error("failed to parse {source_name}: {detail}")]
    Parse { source_name: String, detail: String },

    #[error("unsupported input format: {0} (expected json, csv, jsonl, or text)")]
    UnsupportedFormat(String),

    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("metric mismatch: index uses {expected}, requested {actual}")]
    MetricMismatch {
        expected: DistanceMetric,
        actual: DistanceMetric,
    },

    /// The embedding model could not be loaded or reached.
    #[error("embedding model '{model}' unavailable: {reason}")]
    EmbeddingUnavailable { model: String, reason: String },

    /// A single text could not be embedded; the model itself is healthy.
    #[error("text could not be embedded: {reason}")]
    Embedding { reason: String },

    #[error("index '{0}' not found; ingest data first")]
    IndexNotFound(String),

    #[error("{backend} storage unavailable at {target}: {reason}")]
    StorageUnavailable {
        backend: String,
        target: String,
        reason: String,
    },

    #[error("ingest finished with failures: {succeeded} succeeded, {failed} failed")]
    PartialIngestFailure { succeeded: usize, failed: usize },

    #[error("ingest aborted after committing {committed} documents ({failed} failed): {source}")]
    IngestAborted {
        committed: usize,
        failed: usize,
        #[source]
        source: Box<KbError>,
    },

    #[error("ingest cancelled after committing {committed} documents")]
    Cancelled { committed: usize },
}

impl KbError {
    /// Whether this error should stop a pipeline rather than be recorded
    /// against a single document.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            KbError::Embedding { .. } | KbError::DimensionMismatch { .. }
        )
    }

    pub fn storage(
        backend: impl Into<String>,
        target: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        KbError::StorageUnavailable {
            backend: backend.into(),
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KbError>;
