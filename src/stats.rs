//! Index statistics.
//!
//! `kb stats` summarizes what is stored: backend, file size, the
//! configured collection, and every collection in the database file.

use anyhow::Result;

use crate::backend;
use crate::config::Config;

pub async fn run_stats(config: &Config) -> Result<()> {
    println!("Semantic KB Index Stats");
    println!("======================");
    println!();
    println!("  Backend:     {}", config.index.backend);

    if config.index.backend != "sqlite" {
        let index = backend::open_index(config).await?;
        println!("  Collection:  {}", config.index.collection);
        println!("  Entries:     {}", index.count().await?);
        println!("  Search:      {}", config.index.search);
        println!();
        println!("  (memory indexes are not persisted between runs)");
        println!();
        return Ok(());
    }

    let index = backend::open_sqlite(config).await?;
    let size = std::fs::metadata(&config.index.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let collections = index.collections().await?;

    println!("  Database:    {}", config.index.path.display());
    println!("  Size:        {}", format_bytes(size));
    println!();

    match collections.iter().find(|c| c.name == config.index.collection) {
        Some(info) => {
            println!("  Collection:  {}", info.name);
            println!("  Entries:     {}", info.entries);
            println!("  Dimension:   {}", info.spec.dimension);
            println!("  Metric:      {}", info.spec.metric);
            println!("  Created:     {}", format_ts_iso(info.created_at));
        }
        None => {
            println!(
                "  Collection:  {} (not created; run `kb init` or `kb ingest`)",
                config.index.collection
            );
        }
    }

    if collections.len() > 1 {
        println!();
        println!("  All collections:");
        println!(
            "  {:<24} {:>8} {:>6} {:>10}",
            "NAME", "ENTRIES", "DIM", "METRIC"
        );
        println!("  {}", "-".repeat(52));
        for c in &collections {
            println!(
                "  {:<24} {:>8} {:>6} {:>10}",
                c.name, c.entries, c.spec.dimension, c.spec.metric.as_str()
            );
        }
    }

    println!();
    index.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
