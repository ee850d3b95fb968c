//! `kb init` and `kb delete`.

use anyhow::{Context, Result};

use semantic_kb_core::models::IndexSpec;

use crate::backend;
use crate::config::Config;
use crate::embedding;

/// Create the configured collection, sized for the configured embedder.
///
/// Idempotent: an existing collection with the same shape is left as is.
/// An existing, populated collection with a different shape is an error.
pub async fn run_init(config: &Config) -> Result<()> {
    let embedder = embedding::create_embedder(&config.embedding).await?;
    let index = backend::open_index(config).await?;
    let spec = IndexSpec::new(embedder.dims(), config.index.metric);

    index
        .create(spec)
        .await
        .with_context(|| format!("Failed to create index {}", index.target()))?;

    println!("Index initialized: {}", index.target());
    println!("  backend: {}", index.backend());
    println!("  dimension: {}", spec.dimension);
    println!("  metric: {}", spec.metric);
    println!("  model: {}", embedder.model_name());
    Ok(())
}

/// Delete one entry by id. Deleting an absent id is not an error.
pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let index = backend::open_index(config).await?;
    if index.delete(id).await? {
        println!("Deleted {}", id);
    } else {
        println!("No entry with id {}", id);
    }
    Ok(())
}
