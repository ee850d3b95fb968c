//! `kb search`: semantic search from the command line.
//!
//! Output (colour only when stdout is a terminal):
//!
//! ```text
//! #1 BYD Han EV (similarity: 87.3%)
//!     An electric sedan with a blade battery...
//!     tags: ev, sedan
//!     imported: 2026-10-19
//!     source: cars.json
//! ================================================================================
//! found 1 results
//! ```

use anyhow::{Context, Result};

use semantic_kb_core::models::QueryResult;
use semantic_kb_core::query::QueryPipeline;

use crate::backend;
use crate::config::Config;
use crate::embedding;

const SEPARATOR_WIDTH: usize = 80;

const BOLD: &str = "\u{1b}[1m";
const GREEN: &str = "\u{1b}[32m";
const DIM: &str = "\u{1b}[2m";
const RESET: &str = "\u{1b}[0m";

/// Metadata fields shown as the result's origin, in order of preference.
const SOURCE_FIELDS: &[&str] = &["source", "source_file", "url"];

pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let limit = limit.unwrap_or(config.retrieval.default_limit);
    let index = backend::open_index(config).await?;
    let embedder = embedding::create_embedder(&config.embedding).await?;

    let pipeline = QueryPipeline::new(embedder.as_ref(), index.as_ref(), config.rank_options());
    let results = pipeline
        .search(query, limit)
        .await
        .with_context(|| format!("Search failed for query '{}'", query))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No matching results.");
        return Ok(());
    }

    let color = atty::is(atty::Stream::Stdout);
    for result in &results {
        print!("{}", format_result(result, color));
    }
    println!("found {} results", results.len());
    Ok(())
}

/// Render one result block, separator included.
pub fn format_result(result: &QueryResult, color: bool) -> String {
    let (bold, green, dim, reset) = if color {
        (BOLD, GREEN, DIM, RESET)
    } else {
        ("", "", "", "")
    };
    let payload = &result.payload;

    let title = payload
        .title
        .clone()
        .or_else(|| payload.metadata.get("name").map(|v| v.to_string()))
        .unwrap_or_else(|| result.id.clone());

    let mut out = format!(
        "{bold}#{} {}{reset} {green}(similarity: {:.1}%){reset}\n",
        result.rank, title, result.similarity
    );
    out.push_str(&format!("    {}\n", result.preview.replace('\n', " ").trim()));
    if !payload.tags.is_empty() {
        out.push_str(&format!("    {dim}tags:{reset} {}\n", payload.tags.join(", ")));
    }
    out.push_str(&format!(
        "    {dim}imported:{reset} {}\n",
        payload.import_timestamp.format("%Y-%m-%d")
    ));
    if let Some(source) = SOURCE_FIELDS
        .iter()
        .find_map(|f| payload.metadata.get(*f))
    {
        out.push_str(&format!("    {dim}source:{reset} {}\n", source));
    }
    out.push_str(&format!("    {dim}id:{reset} {}\n", result.id));
    out.push_str(&"=".repeat(SEPARATOR_WIDTH));
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use semantic_kb_core::models::{MetadataValue, Payload};
    use std::collections::BTreeMap;

    fn result() -> QueryResult {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "source_file".to_string(),
            MetadataValue::String("recipes.txt".into()),
        );
        QueryResult {
            rank: 1,
            id: "r1".into(),
            score: 0.873,
            similarity: 87.3,
            preview: "A classic\napple pie".into(),
            payload: Payload {
                title: Some("Apple pie".into()),
                body: "A classic\napple pie".into(),
                tags: vec!["dessert".into(), "fruit".into()],
                metadata,
                extra: BTreeMap::new(),
                import_timestamp: chrono::Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn test_format_plain() {
        let text = format_result(&result(), false);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#1 Apple pie (similarity: 87.3%)");
        assert_eq!(lines[1], "    A classic apple pie");
        assert_eq!(lines[2], "    tags: dessert, fruit");
        assert_eq!(lines[3], "    imported: 2026-10-19");
        assert_eq!(lines[4], "    source: recipes.txt");
        assert_eq!(lines.last().unwrap().len(), SEPARATOR_WIDTH);
    }

    #[test]
    fn test_format_color_wraps_title() {
        let text = format_result(&result(), true);
        assert!(text.starts_with(BOLD));
        assert!(text.contains(RESET));
    }
}
