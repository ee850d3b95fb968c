//! # Semantic KB
//!
//! A local semantic knowledge base: ingest structured records, embed them,
//! and retrieve the most similar ones for a natural-language query.
//!
//! The engine itself (normalizer, index contract, in-memory and HNSW
//! indexes, ranker, pipelines) lives in [`semantic_kb_core`]. This crate
//! adds the pieces that touch the outside world.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────┐   ┌──────────┐   ┌──────────────┐
//! │ json/csv/   │──▶│ Normalizer │──▶│ Embedder │──▶│ VectorIndex  │
//! │ jsonl/text  │   └────────────┘   └──────────┘   │ sqlite/memory│
//! └─────────────┘                                   └──────┬───────┘
//!                                                          │
//!                      ┌───────────────────────────────────┤
//!                      ▼                                   ▼
//!                 ┌──────────┐                       ┌──────────┐
//!                 │   CLI    │                       │   HTTP   │
//!                 │  (kb)    │                       │store/find│
//!                 └──────────┘                       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                          # create the index
//! kb ingest demos/sample_kb_data.json
//! kb search "electric sedan with long range"
//! kb serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`reader`] | Input file formats |
//! | [`embedding`] | Embedding providers |
//! | [`sqlite_index`] | Durable SQLite vector index |
//! | [`backend`] | Backend selection from config |
//! | [`ingest`] | `kb ingest` |
//! | [`search`] | `kb search` |
//! | [`server`] | HTTP store/find server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backend;
pub mod config;
pub mod db;
pub mod embedding;
pub mod export;
pub mod ingest;
pub mod manage;
pub mod migrate;
pub mod progress;
pub mod reader;
pub mod search;
pub mod server;
pub mod sqlite_index;
pub mod stats;
