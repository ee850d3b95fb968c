//! Concrete [`Embedder`] implementations and the provider factory.
//!
//! - **[`HashEmbedder`]**: offline feature hashing; the default.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: fastembed models run in-process (feature
//!   `local-embeddings-fastembed`); the model is loaded once per embedder.
//! - **[`DisabledEmbedder`]**: every call fails with `EmbeddingUnavailable`.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use semantic_kb::config::EmbeddingConfig;
//! # use semantic_kb::embedding::create_embedder;
//! # async fn example() -> anyhow::Result<()> {
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let embedder = create_embedder(&config).await?;
//! assert_eq!(embedder.model_name(), "hash-384");
//! # Ok(())
//! # }
//! ```
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - network errors → retry
//! - other 4xx → no retry
//! - backoff: 1s, 2s, 4s, ... capped at 32s
//!
//! Once retries are exhausted the model is reported as unavailable, which
//! aborts an ingest run. A non-retryable rejection of a multi-text batch
//! is retried text by text so only the offending texts fail.

mod hash;

pub use hash::{tokenize, HashEmbedder, DEFAULT_HASH_DIMS};

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use semantic_kb_core::embedding::Embedder;
use semantic_kb_core::KbError;

use crate::config::EmbeddingConfig;

type KbResult<T> = semantic_kb_core::Result<T>;

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Why a provider request gave up.
#[derive(Debug)]
enum ProviderFailure {
    /// Retries exhausted, auth refused, or the service is unreachable.
    Unavailable(String),
    /// The model understood the request and refused these inputs.
    Rejected(String),
}

/// POST `body` to `url`, retrying transient failures.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> std::result::Result<serde_json::Value, ProviderFailure> {
    let mut last_err = String::from("no attempt made");

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(attempt, ?delay, "{} embedding retry", label);
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        ProviderFailure::Unavailable(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = format!("{} API error {}: {}", label, status, body_text);
                    continue;
                }
                if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 404 {
                    return Err(ProviderFailure::Unavailable(format!(
                        "{} API error {}: {}",
                        label, status, body_text
                    )));
                }
                return Err(ProviderFailure::Rejected(format!(
                    "{} API error {}: {}",
                    label, status, body_text
                )));
            }
            Err(e) => {
                last_err = format!("{} connection error ({}): {}", label, url, e);
                continue;
            }
        }
    }

    Err(ProviderFailure::Unavailable(last_err))
}

/// Run `request` over `texts`, isolating per-text rejections.
async fn embed_isolating<F, Fut>(model: &str, texts: &[String], request: F) -> Vec<KbResult<Vec<f32>>>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<Vec<f32>>, ProviderFailure>>,
{
    let unavailable = |reason: &str| KbError::EmbeddingUnavailable {
        model: model.to_string(),
        reason: reason.to_string(),
    };

    match request(texts.to_vec()).await {
        Ok(vectors) if vectors.len() == texts.len() => return vectors.into_iter().map(Ok).collect(),
        Ok(vectors) => {
            let reason = format!("expected {} vectors, got {}", texts.len(), vectors.len());
            return texts.iter().map(|_| Err(unavailable(&reason))).collect();
        }
        Err(ProviderFailure::Unavailable(reason)) => {
            return texts.iter().map(|_| Err(unavailable(&reason))).collect();
        }
        Err(ProviderFailure::Rejected(reason)) if texts.len() == 1 => {
            return vec![Err(KbError::Embedding { reason })];
        }
        Err(ProviderFailure::Rejected(reason)) => {
            tracing::debug!(%reason, texts = texts.len(), "batch rejected, embedding one by one");
        }
    }

    let mut out = Vec::with_capacity(texts.len());
    for text in texts {
        let result = match request(vec![text.clone()]).await {
            Ok(mut vectors) if vectors.len() == 1 => Ok(vectors.remove(0)),
            Ok(vectors) => Err(unavailable(&format!("expected 1 vector, got {}", vectors.len()))),
            Err(ProviderFailure::Unavailable(reason)) => Err(unavailable(&reason)),
            Err(ProviderFailure::Rejected(reason)) => Err(KbError::Embedding { reason }),
        };
        out.push(result);
    }
    out
}

fn build_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn first_result(mut results: Vec<KbResult<Vec<f32>>>) -> KbResult<Vec<f32>> {
    if results.is_empty() {
        return Err(KbError::Embedding {
            reason: "empty embedding response".to_string(),
        });
    }
    results.swap_remove(0)
}

// ============ Disabled ============

/// Reports the model as unavailable on every call.
pub struct DisabledEmbedder {
    dims: usize,
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, _text: &str) -> KbResult<Vec<f32>> {
        Err(KbError::EmbeddingUnavailable {
            model: "disabled".to_string(),
            reason: "embedding provider is disabled; set [embedding] provider in config".to_string(),
        })
    }
}

// ============ OpenAI ============

/// Embedder using the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let endpoint = config
            .url
            .as_deref()
            .map(|u| format!("{}/v1/embeddings", u.trim_end_matches('/')))
            .unwrap_or_else(|| OPENAI_ENDPOINT.to_string());

        Ok(Self {
            model,
            dims,
            api_key,
            endpoint,
            max_retries: config.max_retries,
            client: build_client(config)?,
        })
    }

    async fn request(&self, texts: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            &self.endpoint,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json).map_err(|e| ProviderFailure::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> KbResult<Vec<f32>> {
        first_result(self.embed_batch(&[text.to_string()]).await)
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<KbResult<Vec<f32>>> {
        embed_isolating(&self.model, texts, |batch| self.request(batch)).await
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        indexed.push((index, json_floats(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn json_floats(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid embedding element: {}", v))
        })
        .collect()
}

// ============ Ollama ============

/// Embedder using a local Ollama instance (`ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: build_client(config)?,
        })
    }

    async fn request(&self, texts: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json).map_err(|e| ProviderFailure::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> KbResult<Vec<f32>> {
        first_result(self.embed_batch(&[text.to_string()]).await)
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<KbResult<Vec<f32>>> {
        embed_isolating(&self.model, texts, |batch| self.request(batch)).await
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?;
            json_floats(values)
        })
        .collect()
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    /// Load (downloading on first use) the configured fastembed model.
    pub async fn load(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        let fastembed_model = config_to_fastembed_model(&model_name)?;

        let model = tokio::task::spawn_blocking(move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
            )
        })
        .await?
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }

    async fn request(&self, texts: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure> {
        let model = self.model.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| ProviderFailure::Unavailable("local model lock poisoned".into()))?;
            guard
                .embed(texts, None)
                .map_err(|e| ProviderFailure::Rejected(e.to_string()))
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => Err(ProviderFailure::Unavailable(format!("embedding task failed: {}", e))),
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> KbResult<Vec<f32>> {
        first_result(self.embed_batch(&[text.to_string()]).await)
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<KbResult<Vec<f32>>> {
        embed_isolating(&self.model_name, texts, |batch| self.request(batch)).await
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, \
             multilingual-e5-large",
            other
        ),
    }
}

/// Create the [`Embedder`] selected by `[embedding].provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings-fastembed`) |
/// | `"disabled"` | [`DisabledEmbedder`] |
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.provider.as_str() {
        "hash" => {
            let dims = config.dims.unwrap_or(DEFAULT_HASH_DIMS);
            Arc::new(HashEmbedder::new(dims))
        }
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalEmbedder::load(config).await?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        "disabled" => Arc::new(DisabledEmbedder {
            dims: config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        }),
        other => bail!("Unknown embedding provider: {}", other),
    };

    tracing::info!(
        provider = %config.provider,
        model = embedder.model_name(),
        dims = embedder.dims(),
        "embedder ready"
    );
    Ok(embedder)
}
