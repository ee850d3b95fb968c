//! # semantic-kb core
//!
//! Shared, runtime-agnostic logic for semantic-kb: data models, record
//! normalization, the embedder capability trait, the vector index
//! abstraction (with an in-memory exact/HNSW implementation), ranking,
//! and the ingest and query pipelines.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concrete
//! embedders, durable index backends, file readers, and the CLI live in
//! the `semantic-kb` application crate.
//!
//! ```text
//! raw records ─▶ normalize ─▶ Document ─▶ Embedder ─▶ VectorIndex::upsert_batch
//! query text  ─▶ Embedder ─▶ VectorIndex::query ─▶ Ranker ─▶ QueryResult
//! ```

pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod query;
pub mod rank;

pub use error::{KbError, Result};
