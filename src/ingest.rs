//! `kb ingest`: read a file, embed its records, and write them to the index.
//!
//! Ctrl-C cancels the run between batches. Batches already committed stay
//! in the index; the batch in flight is dropped whole.

use anyhow::{Context, Result};
use std::path::Path;

use semantic_kb_core::ingest::{CancellationToken, IngestPipeline, RecordSource};
use semantic_kb_core::normalize::{normalize, record_id};

use crate::backend;
use crate::config::Config;
use crate::embedding;
use crate::progress::ProgressMode;
use crate::reader::{FileSource, InputFormat};

/// Command-line overrides for one ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestArgs {
    pub format: Option<String>,
    pub text_field: Option<String>,
    pub id_field: Option<String>,
    pub batch_size: Option<usize>,
    pub dry_run: bool,
}

pub async fn run_ingest(
    config: &Config,
    path: &Path,
    args: IngestArgs,
    progress: ProgressMode,
) -> Result<()> {
    let format = args
        .format
        .as_deref()
        .map(str::parse::<InputFormat>)
        .transpose()?;
    let source = FileSource::new(path, format)?;

    let mut config = config.clone();
    if let Some(field) = args.text_field {
        config.ingest.text_field = field;
    }
    if let Some(field) = args.id_field {
        config.ingest.id_field = field;
    }
    if let Some(size) = args.batch_size {
        anyhow::ensure!(size > 0, "--batch-size must be > 0");
        config.ingest.batch_size = size;
    }

    if args.dry_run {
        return dry_run(&config, &source).await;
    }

    let embedder = embedding::create_embedder(&config.embedding).await?;
    let index = backend::open_index(&config).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; stopping after the current batch.");
            on_interrupt.cancel();
        }
    });

    let reporter = progress.reporter(&source.name());
    let pipeline = IngestPipeline::new(embedder.as_ref(), index.as_ref(), config.ingest_options())
        .with_observer(reporter.as_ref())
        .with_cancellation(cancel);
    let outcome = pipeline.run(&source).await;
    interrupt.abort();

    let report = outcome.with_context(|| format!("Failed to ingest {}", path.display()))?;

    println!("ingest {}", path.display());
    println!("  format: {}", source.format());
    println!("  index: {} ({})", index.target(), index.backend());
    println!("  model: {}", embedder.model_name());
    println!("  records: {}", report.total);
    println!("  batches: {}", report.batches);
    println!("  succeeded: {}", report.succeeded);
    println!("  failed: {}", report.failures.len());
    for failure in &report.failures {
        println!("    {}", failure);
    }
    if report.failures.is_empty() {
        println!("ok");
    }

    report.into_result()?;
    Ok(())
}

/// Read and normalize without embedding or writing anything.
async fn dry_run(config: &Config, source: &FileSource) -> Result<()> {
    let records = source.read().await?;
    let options = config.normalize_options();

    let docs: Vec<_> = records
        .iter()
        .enumerate()
        .map(|(i, raw)| normalize(raw, i, &options))
        .collect();
    let auto_ids = records
        .iter()
        .filter(|raw| record_id(raw, &options.id_field).is_none())
        .count();
    let untitled = docs.iter().filter(|d| d.title.is_none()).count();

    println!("ingest {} (dry-run)", source.name());
    println!("  format: {}", source.format());
    println!("  records: {}", records.len());
    println!("  documents: {}", docs.len());
    println!("  with '{}' field: {}", options.id_field, records.len() - auto_ids);
    if auto_ids > 0 {
        println!(
            "  generated ids: {} (re-ingesting these records will duplicate them)",
            auto_ids
        );
    }
    println!("  untitled: {}", untitled);
    Ok(())
}
