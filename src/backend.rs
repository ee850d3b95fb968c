//! Open the configured [`VectorIndex`] backend.
//!
//! | `[index].backend` | Index |
//! |-------------------|-------|
//! | `"sqlite"` | [`SqliteIndex`] at `[index].path`, durable |
//! | `"memory"` | [`InMemoryIndex`], lives only as long as the process |

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use semantic_kb_core::index::memory::InMemoryIndex;
use semantic_kb_core::index::VectorIndex;

use crate::config::Config;
use crate::sqlite_index::SqliteIndex;

pub async fn open_index(config: &Config) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match config.index.backend.as_str() {
        "sqlite" => Arc::new(open_sqlite(config).await?),
        "memory" => Arc::new(InMemoryIndex::new(
            config.index.collection.clone(),
            config.search_mode(),
        )),
        other => bail!("Unknown index backend: {}", other),
    };

    tracing::debug!(backend = index.backend(), target = %index.target(), "index opened");
    Ok(index)
}

pub async fn open_sqlite(config: &Config) -> Result<SqliteIndex> {
    SqliteIndex::open(&config.index.path, &config.index.collection)
        .await
        .with_context(|| format!("Failed to open index at {}", config.index.path.display()))
}
