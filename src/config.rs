//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration: a SQLite index at
//! `./data/kb.sqlite` embedded with the offline `hash` provider.
//!
//! ```toml
//! [index]
//! backend = "sqlite"          # sqlite | memory
//! path = "./data/kb.sqlite"
//! collection = "knowledge_base"
//! metric = "cosine"           # cosine | dot | euclidean
//! search = "exact"            # exact | hnsw (memory backend)
//!
//! [embedding]
//! provider = "hash"           # hash | openai | ollama | local | disabled
//!
//! [ingest]
//! batch_size = 100
//! embed_concurrency = 4
//!
//! [retrieval]
//! default_limit = 10
//! preview_chars = 200
//!
//! [server]
//! bind = "127.0.0.1:6334"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use semantic_kb_core::index::hnsw::HnswParams;
use semantic_kb_core::index::memory::SearchMode;
use semantic_kb_core::ingest::IngestOptions;
use semantic_kb_core::models::DistanceMetric;
use semantic_kb_core::normalize::NormalizeOptions;
use semantic_kb_core::rank::{HighlightMarkers, RankOptions};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub metric: DistanceMetric,
    #[serde(default = "default_search")]
    pub search: String,
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_index_path(),
            collection: default_collection(),
            metric: DistanceMetric::default(),
            search: default_search(),
            hnsw_m: default_hnsw_m(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            hnsw_ef_search: default_hnsw_ef_search(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_index_path() -> PathBuf {
    PathBuf::from("./data/kb.sqlite")
}
fn default_collection() -> String {
    "knowledge_base".to_string()
}
fn default_search() -> String {
    "exact".to_string()
}
fn default_hnsw_m() -> usize {
    16
}
fn default_hnsw_ef_construction() -> usize {
    100
}
fn default_hnsw_ef_search() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    /// Field holding the primary text. Empty means "use the built-in names".
    #[serde(default)]
    pub text_field: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            embed_concurrency: default_embed_concurrency(),
            text_field: String::new(),
            id_field: default_id_field(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    #[serde(default)]
    pub highlight: bool,
    #[serde(default = "default_highlight_pre")]
    pub highlight_pre: String,
    #[serde(default = "default_highlight_post")]
    pub highlight_post: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            preview_chars: default_preview_chars(),
            highlight: false,
            highlight_pre: default_highlight_pre(),
            highlight_post: default_highlight_post(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_preview_chars() -> usize {
    200
}
fn default_highlight_pre() -> String {
    "\u{1b}[1;33m".to_string()
}
fn default_highlight_post() -> String {
    "\u{1b}[0m".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:6334".to_string()
}

impl Config {
    pub fn search_mode(&self) -> SearchMode {
        match self.index.search.as_str() {
            "hnsw" => SearchMode::Hnsw(HnswParams {
                m: self.index.hnsw_m,
                ef_construction: self.index.hnsw_ef_construction,
                ef_search: self.index.hnsw_ef_search,
            }),
            _ => SearchMode::Exact,
        }
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        let text_field = self.ingest.text_field.trim();
        NormalizeOptions {
            text_field: (!text_field.is_empty()).then(|| text_field.to_string()),
            id_field: self.ingest.id_field.clone(),
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            batch_size: self.ingest.batch_size,
            embed_concurrency: self.ingest.embed_concurrency,
            metric: self.index.metric,
            normalize: self.normalize_options(),
        }
    }

    pub fn rank_options(&self) -> RankOptions {
        RankOptions {
            preview_chars: self.retrieval.preview_chars,
            highlight: self.retrieval.highlight.then(|| {
                HighlightMarkers::new(
                    self.retrieval.highlight_pre.clone(),
                    self.retrieval.highlight_post.clone(),
                )
            }),
        }
    }
}

/// Load and validate the configuration at `path`.
///
/// A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.index.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown index backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }
    match config.index.search.as_str() {
        "exact" | "hnsw" => {}
        other => bail!("Unknown index search mode: '{}'. Must be exact or hnsw.", other),
    }
    if config.index.collection.trim().is_empty() {
        bail!("index.collection must not be empty");
    }
    if config.index.hnsw_m < 2 {
        bail!("index.hnsw_m must be >= 2");
    }
    if config.index.hnsw_ef_construction == 0 || config.index.hnsw_ef_search == 0 {
        bail!("index.hnsw_ef_construction and index.hnsw_ef_search must be > 0");
    }

    if config.ingest.batch_size == 0 {
        bail!("ingest.batch_size must be > 0");
    }
    if config.ingest.embed_concurrency == 0 {
        bail!("ingest.embed_concurrency must be > 0");
    }
    if config.ingest.id_field.trim().is_empty() {
        bail!("ingest.id_field must not be empty");
    }

    if config.retrieval.default_limit < 1 {
        bail!("retrieval.default_limit must be >= 1");
    }
    if config.retrieval.preview_chars == 0 {
        bail!("retrieval.preview_chars must be > 0");
    }

    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "local" | "disabled" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.index.backend, "sqlite");
        assert_eq!(config.index.collection, "knowledge_base");
        assert_eq!(config.index.metric, DistanceMetric::Cosine);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.ingest.batch_size, 100);
        assert_eq!(config.retrieval.default_limit, 10);
        assert_eq!(config.server.bind, "127.0.0.1:6334");
        assert_eq!(config.search_mode(), SearchMode::Exact);
        assert!(config.rank_options().highlight.is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Path::new("/nonexistent/kb.toml")).unwrap();
        assert_eq!(config.ingest.embed_concurrency, 4);
    }

    #[test]
    fn test_sections_override() {
        let config = parse(
            r#"
            [index]
            backend = "memory"
            metric = "euclidean"
            search = "hnsw"
            hnsw_m = 8

            [ingest]
            text_field = "summary"

            [retrieval]
            highlight = true
            highlight_pre = "<b>"
            highlight_post = "</b>"
            "#,
        )
        .unwrap();
        assert_eq!(config.index.metric, DistanceMetric::Euclidean);
        match config.search_mode() {
            SearchMode::Hnsw(params) => assert_eq!(params.m, 8),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(config.normalize_options().text_field.as_deref(), Some("summary"));
        let markers = config.rank_options().highlight.unwrap();
        assert_eq!(markers.pre, "<b>");
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let config = parse(include_str!("../config/kb.example.toml")).unwrap();
        assert_eq!(config.index.path, default_index_path());
        assert_eq!(config.retrieval.highlight_pre, default_highlight_pre());
        assert_eq!(config.ingest.text_field, "");
    }

    #[test]
    fn test_validation_errors() {
        assert!(parse("[index]\nbackend = \"qdrant\"").is_err());
        assert!(parse("[ingest]\nbatch_size = 0").is_err());
        assert!(parse("[retrieval]\ndefault_limit = 0").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"").is_err());
        assert!(parse("[embedding]\nprovider = \"nope\"").is_err());
        assert!(parse("[index]\nmetric = \"manhattan\"").is_err());
    }
}
