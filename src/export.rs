//! Export the index as JSON Lines.
//!
//! Walks the collection with [`VectorIndex::scroll`] in insertion order and
//! writes one object per entry: the id, the stored payload fields, and
//! (with `--vectors`) the raw embedding.

use anyhow::Result;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use semantic_kb_core::index::VectorIndex;
use semantic_kb_core::models::{IndexEntry, Payload};
use semantic_kb_core::KbError;

use crate::backend;
use crate::config::Config;

const PAGE_SIZE: usize = 256;

#[derive(Serialize)]
struct ExportLine<'a> {
    id: &'a str,
    #[serde(flatten)]
    payload: &'a Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector: Option<&'a [f32]>,
}

/// Export every entry of the configured collection.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>, vectors: bool) -> Result<()> {
    let index = backend::open_index(config).await?;

    let count = match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let count = export_to(index.as_ref(), &mut file, vectors).await?;
            file.flush()?;
            eprintln!("Exported {} entries to {}", count, path.display());
            count
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            export_to(index.as_ref(), &mut lock, vectors).await?
        }
    };

    tracing::info!(entries = count, "export complete");
    Ok(())
}

/// Write every entry of `index` to `out`, one JSON object per line.
pub async fn export_to(
    index: &dyn VectorIndex,
    out: &mut dyn Write,
    vectors: bool,
) -> Result<usize> {
    if !index.exists().await? {
        return Err(KbError::IndexNotFound(index.target()).into());
    }

    let mut cursor = None;
    let mut count = 0;
    loop {
        let page = index.scroll(cursor, PAGE_SIZE).await?;
        for entry in &page.entries {
            write_line(out, entry, vectors)?;
            count += 1;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(count)
}

fn write_line(out: &mut dyn Write, entry: &IndexEntry, vectors: bool) -> Result<()> {
    let line = ExportLine {
        id: &entry.id,
        payload: &entry.payload,
        vector: vectors.then_some(entry.vector.as_slice()),
    };
    serde_json::to_writer(&mut *out, &line)?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use semantic_kb_core::index::memory::{InMemoryIndex, SearchMode};
    use semantic_kb_core::models::{DistanceMetric, IndexSpec};
    use std::collections::BTreeMap;

    fn entry(id: &str, body: &str) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            vector: vec![1.0, 0.0],
            payload: Payload {
                title: None,
                body: body.to_string(),
                tags: vec![],
                metadata: BTreeMap::new(),
                extra: BTreeMap::new(),
                import_timestamp: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_export_pages_in_order() {
        let index = InMemoryIndex::with_spec(
            "kb",
            SearchMode::Exact,
            IndexSpec::new(2, DistanceMetric::Cosine),
        );
        let entries: Vec<IndexEntry> = (0..PAGE_SIZE + 3)
            .map(|i| entry(&format!("d{}", i), "text"))
            .collect();
        index.upsert_batch(entries).await.unwrap();

        let mut buf: Vec<u8> = Vec::new();
        let count = export_to(&index, &mut buf, false).await.unwrap();
        assert_eq!(count, PAGE_SIZE + 3);

        let text = String::from_utf8(buf).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["id"], "d0");
        assert_eq!(first["body"], "text");
        assert!(first.get("vector").is_none());
        assert_eq!(text.lines().count(), PAGE_SIZE + 3);
    }

    #[tokio::test]
    async fn test_export_missing_index() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let mut buf: Vec<u8> = Vec::new();
        assert!(export_to(&index, &mut buf, true).await.is_err());
    }
}
