//! HTTP store/find server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/store` | Embed and store one piece of information |
//! | `POST` | `/find` | Semantic search over stored information |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! ```json
//! POST /store {"information": "Blade battery packs are LFP cells", "metadata": {"tags": "ev"}}
//! → {"status": "stored", "id": "7f7c..."}
//!
//! POST /find {"query": "battery chemistry", "limit": 3}
//! → {"results": [{"id": "7f7c...", "score": 0.82, "similarity": 82.0,
//!                 "content": "Blade battery packs are LFP cells", "metadata": {...}}]}
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "information must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `embedding_unavailable` (503), `storage_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients can
//! call the server directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use semantic_kb_core::embedding::Embedder;
use semantic_kb_core::index::VectorIndex;
use semantic_kb_core::ingest::IngestPipeline;
use semantic_kb_core::models::{QueryResult, RawRecord};
use semantic_kb_core::query::QueryPipeline;
use semantic_kb_core::KbError;

use crate::backend;
use crate::config::Config;
use crate::embedding;

/// Shared state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl AppState {
    pub fn new(config: Config, index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config: Arc::new(config),
            index,
            embedder,
        }
    }
}

/// Build the router with CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/store", post(handle_store))
        .route("/find", post(handle_find))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server].bind` and run until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedder = embedding::create_embedder(&config.embedding).await?;
    let index = backend::open_index(config).await?;
    let bind_addr = config.server.bind.clone();

    let app = router(AppState::new(config.clone(), index.clone(), embedder));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!(
        "Knowledge base server listening on http://{} ({})",
        listener.local_addr()?,
        index.target()
    );
    tracing::info!(bind = %bind_addr, backend = index.backend(), "server started");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let message = err.to_string();
        match err {
            KbError::IngestAborted { source, .. } => AppError::from(*source),
            KbError::IndexNotFound(_) => AppError::new(StatusCode::NOT_FOUND, "not_found", message),
            KbError::Embedding { .. }
            | KbError::DimensionMismatch { .. }
            | KbError::MetricMismatch { .. }
            | KbError::PartialIngestFailure { .. } => bad_request(message),
            KbError::EmbeddingUnavailable { .. } => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "embedding_unavailable",
                message,
            ),
            KbError::StorageUnavailable { .. } => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
            ),
            _ => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /store ============

#[derive(Deserialize)]
struct StoreRequest {
    information: String,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Serialize)]
struct StoreResponse {
    status: String,
    id: String,
}

/// Fields the server owns; request metadata cannot override them.
const RESERVED_FIELDS: &[&str] = &["id", "content"];

/// Store one piece of information under a fresh UUID.
///
/// Runs through the same pipeline as `kb ingest`, so the index is created
/// on first use with the embedder's dimension.
async fn handle_store(
    State(state): State<AppState>,
    Json(req): Json<StoreRequest>,
) -> Result<Json<StoreResponse>, AppError> {
    if req.information.trim().is_empty() {
        return Err(bad_request("information must not be empty"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let mut record = RawRecord::new();
    record.insert("id".into(), serde_json::Value::String(id.clone()));
    record.insert(
        "content".into(),
        serde_json::Value::String(req.information),
    );
    for (key, value) in req.metadata.unwrap_or_default() {
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            record.insert(key, value);
        }
    }

    let mut options = state.config.ingest_options();
    options.normalize.id_field = "id".to_string();
    options.normalize.text_field = Some("content".to_string());

    let pipeline = IngestPipeline::new(state.embedder.as_ref(), state.index.as_ref(), options);
    let report = pipeline.run(&vec![record]).await?;
    if let Some(failure) = report.failures.first() {
        return Err(bad_request(failure.reason.clone()));
    }

    tracing::debug!(%id, "stored");
    Ok(Json(StoreResponse {
        status: "stored".to_string(),
        id,
    }))
}

// ============ POST /find ============

#[derive(Deserialize)]
struct FindRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct FindResponse {
    results: Vec<FindResult>,
}

#[derive(Serialize)]
struct FindResult {
    id: String,
    score: f64,
    similarity: f64,
    content: String,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<QueryResult> for FindResult {
    fn from(result: QueryResult) -> Self {
        let payload = result.payload;
        let mut metadata = serde_json::Map::new();
        if let Some(title) = payload.title {
            metadata.insert("title".into(), serde_json::Value::String(title));
        }
        if !payload.tags.is_empty() {
            metadata.insert("tags".into(), serde_json::json!(payload.tags));
        }
        for (key, value) in payload.metadata {
            metadata.insert(key, serde_json::json!(value));
        }
        for (key, value) in payload.extra {
            metadata.insert(key, value);
        }
        metadata.insert(
            "import_timestamp".into(),
            serde_json::Value::String(payload.import_timestamp.to_rfc3339()),
        );

        Self {
            id: result.id,
            score: result.score,
            similarity: result.similarity,
            content: payload.body,
            metadata,
        }
    }
}

async fn handle_find(
    State(state): State<AppState>,
    Json(req): Json<FindRequest>,
) -> Result<Json<FindResponse>, AppError> {
    let limit = req
        .limit
        .unwrap_or(state.config.retrieval.default_limit)
        .min(100);

    let pipeline = QueryPipeline::new(
        state.embedder.as_ref(),
        state.index.as_ref(),
        state.config.rank_options(),
    );
    let results = pipeline.search(&req.query, limit).await?;

    Ok(Json(FindResponse {
        results: results.into_iter().map(FindResult::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let e = AppError::from(KbError::IndexNotFound("kb".into()));
        assert_eq!(e.status, StatusCode::NOT_FOUND);

        let e = AppError::from(KbError::IngestAborted {
            committed: 0,
            failed: 0,
            source: Box::new(KbError::EmbeddingUnavailable {
                model: "m".into(),
                reason: "down".into(),
            }),
        });
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.code, "embedding_unavailable");

        let e = AppError::from(KbError::Embedding { reason: "x".into() });
        assert_eq!(e.code, "bad_request");
    }
}
