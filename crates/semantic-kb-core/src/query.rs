//! Query pipeline: embed the query, ask the index, rank the hits.

use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{KbError, Result};
use crate::index::VectorIndex;
use crate::models::QueryResult;
use crate::rank::{RankOptions, Ranker};

pub const DEFAULT_LIMIT: usize = 10;

pub struct QueryPipeline<'a> {
    embedder: &'a dyn Embedder,
    index: &'a dyn VectorIndex,
    options: RankOptions,
}

impl<'a> QueryPipeline<'a> {
    pub fn new(embedder: &'a dyn Embedder, index: &'a dyn VectorIndex, options: RankOptions) -> Self {
        Self {
            embedder,
            index,
            options,
        }
    }

    /// Return up to `k` ranked results for `text`.
    ///
    /// An index that was never created is [`KbError::IndexNotFound`]; an
    /// empty index or a blank query is an empty result, not an error.
    pub async fn search(&self, text: &str, k: usize) -> Result<Vec<QueryResult>> {
        let Some(spec) = self.index.spec().await? else {
            return Err(KbError::IndexNotFound(self.index.target()));
        };
        if text.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if self.index.count().await? == 0 {
            debug!(index = %self.index.target(), "index is empty");
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(text).await?;
        let hits = self.index.query(&vector, k).await?;
        debug!(hits = hits.len(), k, "index query");

        let ranker = Ranker::new(spec.metric, self.options.clone());
        Ok(ranker.rank(hits, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{InMemoryIndex, SearchMode};
    use crate::models::{DistanceMetric, IndexSpec};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Embedder for Unreachable {
        fn model_name(&self) -> &str {
            "unreachable"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(KbError::EmbeddingUnavailable {
                model: "unreachable".into(),
                reason: "offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_missing_index() {
        let index = InMemoryIndex::new("kb", SearchMode::Exact);
        let pipeline = QueryPipeline::new(&Unreachable, &index, RankOptions::default());
        assert!(matches!(
            pipeline.search("anything", 10).await,
            Err(KbError::IndexNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_index_and_blank_query_skip_embedding() {
        let index = InMemoryIndex::with_spec(
            "kb",
            SearchMode::Exact,
            IndexSpec::new(2, DistanceMetric::Cosine),
        );
        let pipeline = QueryPipeline::new(&Unreachable, &index, RankOptions::default());
        assert!(pipeline.search("anything", 10).await.unwrap().is_empty());
        assert!(pipeline.search("   ", 10).await.unwrap().is_empty());
    }
}
