//! Core data models that flow through the ingest and query pipelines.
//!
//! A raw record becomes a [`Document`] in the normalizer, a [`Document`]
//! becomes an [`IndexEntry`] once embedded, and a query produces
//! [`RawHit`]s from the index which the ranker turns into
//! [`QueryResult`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, dot_product, euclidean_distance};

/// An unnormalized input record, as parsed from JSON, CSV, JSONL, or text.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A scalar metadata value. Dates are kept as their source string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    /// Convert a JSON value into a scalar, or `None` for arrays, objects, and null.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetadataValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(MetadataValue::Integer(i)),
                None => n.as_f64().map(MetadataValue::Float),
            },
            serde_json::Value::String(s) => Some(MetadataValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Integer(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::String(s) => f.write_str(s),
        }
    }
}

/// Canonical ingested unit.
///
/// Immutable once embedded: an update is a delete + reinsert under the
/// same `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Position of the record in its source (0-based), for error reporting.
    pub source_index: usize,
    pub title: Option<String>,
    /// Never empty after normalization.
    pub body: String,
    pub tags: Vec<String>,
    /// Scalar fields not consumed as id/title/body/tags.
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Non-scalar unknown fields, preserved as JSON.
    pub extra: BTreeMap<String, serde_json::Value>,
    pub import_timestamp: DateTime<Utc>,
    /// The exact text handed to the embedder.
    pub embedding_text: String,
}

impl Document {
    /// The payload stored next to this document's vector.
    pub fn payload(&self) -> Payload {
        Payload {
            title: self.title.clone(),
            body: self.body.clone(),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            extra: self.extra.clone(),
            import_timestamp: self.import_timestamp,
        }
    }

    pub fn into_entry(self, vector: Vec<f32>) -> IndexEntry {
        let payload = self.payload();
        IndexEntry {
            id: self.id,
            vector,
            payload,
        }
    }
}

/// Data returned verbatim on query. Never used for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub import_timestamp: DateTime<Utc>,
}

/// `(id, vector, payload)` triple owned by a [`VectorIndex`](crate::index::VectorIndex).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// Distance metric for an index. Smaller distance is always closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`.
    #[default]
    Cosine,
    /// `-(a · b)`.
    Dot,
    /// `‖a - b‖`.
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::Dot => -dot_product(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" => Ok(DistanceMetric::Dot),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            other => Err(format!(
                "unknown distance metric '{}'; use cosine, dot, or euclidean",
                other
            )),
        }
    }
}

/// Shape of an index: every stored vector has `dimension` components and
/// is compared under `metric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub dimension: usize,
    pub metric: DistanceMetric,
}

impl IndexSpec {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self { dimension, metric }
    }
}

/// A nearest-neighbor candidate as returned by the index, before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub id: String,
    pub distance: f32,
    /// Index-assigned insertion sequence; lower was inserted earlier.
    pub seq: u64,
    pub payload: Payload,
}

/// A ranked, presentation-ready query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// 1-based position in the result list.
    pub rank: usize,
    pub id: String,
    /// Normalized similarity (`1 - cosine distance` for cosine indexes).
    pub score: f64,
    /// Similarity as a percentage, clipped to `[0, 100]`.
    pub similarity: f64,
    /// Truncated or highlighted body excerpt.
    pub preview: String,
    pub payload: Payload,
}

/// Opaque position within a [`VectorIndex::scroll`](crate::index::VectorIndex::scroll) scan.
///
/// Only meaningful for the index that produced it, and only while the
/// index is not mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollCursor(u64);

impl ScrollCursor {
    /// Cursor positioned after the entry with insertion sequence `seq`.
    pub fn after(seq: u64) -> Self {
        ScrollCursor(seq)
    }

    pub fn last_seq(&self) -> u64 {
        self.0
    }
}

/// One page of a scroll scan.
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    pub entries: Vec<IndexEntry>,
    /// `None` once the scan is exhausted.
    pub next_cursor: Option<ScrollCursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_parse() {
        assert_eq!("cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("L2".parse::<DistanceMetric>(), Ok(DistanceMetric::Euclidean));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_metric_closer_is_smaller() {
        let q = [1.0, 0.0];
        let near = [0.9, 0.1];
        let far = [0.0, 1.0];
        for metric in [DistanceMetric::Cosine, DistanceMetric::Dot, DistanceMetric::Euclidean] {
            assert!(
                metric.distance(&q, &near) < metric.distance(&q, &far),
                "{} ordering",
                metric
            );
        }
    }

    #[test]
    fn test_metadata_from_json() {
        use serde_json::json;
        assert_eq!(
            MetadataValue::from_json(&json!(3)),
            Some(MetadataValue::Integer(3))
        );
        assert_eq!(
            MetadataValue::from_json(&json!(2.5)),
            Some(MetadataValue::Float(2.5))
        );
        assert_eq!(
            MetadataValue::from_json(&json!("2024-01-01")),
            Some(MetadataValue::String("2024-01-01".into()))
        );
        assert_eq!(MetadataValue::from_json(&json!([1, 2])), None);
        assert_eq!(MetadataValue::from_json(&json!(null)), None);
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = Payload {
            title: Some("A".into()),
            body: "apple pie".into(),
            tags: vec!["food".into()],
            metadata: BTreeMap::from([("source".to_string(), MetadataValue::String("blog".into()))]),
            extra: BTreeMap::new(),
            import_timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["metadata"]["source"], "blog");
        assert!(json.get("extra").is_none());
        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
