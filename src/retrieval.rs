//! Retrieval adapter.
//!
//! The retriever itself is a collaborator behind the [`Retriever`] trait;
//! the adapter enforces tenant isolation, applies the relevance floor, and
//! assembles the context string handed to synthesis. It assumes nothing
//! about the retrieval algorithm beyond score-descending ordering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};

/// Delimiter between chunks in the assembled context string.
pub const CONTEXT_DELIMITER: &str = "\n\n---\n\n";

/// A retrieved passage with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Chunk identifier within the corpus
    pub id: String,
    /// Passage text
    pub content: String,
    /// Relevance score in [0, 1], higher is more relevant
    pub score: f64,
    /// Source document reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Result of one retrieval pass. Chunks are immutable after return and
/// ordered by score, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    /// Number of chunks the retriever reported before filtering
    pub total: usize,
    /// Chunks joined with [`CONTEXT_DELIMITER`]
    pub context_string: String,
    pub elapsed_ms: u64,
}

impl RetrievalResult {
    /// An empty result, used when retrieval is skipped or degraded.
    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            total: 0,
            context_string: String::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk texts, for quality scoring.
    pub fn chunk_texts(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.content.clone()).collect()
    }

    /// Mean relevance score of the returned chunks.
    pub fn mean_score(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        self.chunks.iter().map(|c| c.score).sum::<f64>() / self.chunks.len() as f64
    }
}

/// Collaborator contract: a scored, ordered lookup into a tenant's corpus.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn query(
        &self,
        tenant_id: &str,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>>;
}

/// Adapter over a [`Retriever`] enforcing the core's invariants.
pub struct RetrieverAdapter {
    retriever: Arc<dyn Retriever>,
    min_score: f64,
}

impl RetrieverAdapter {
    pub fn new(retriever: Arc<dyn Retriever>, min_score: f64) -> Self {
        Self {
            retriever,
            min_score: min_score.clamp(0.0, 1.0),
        }
    }

    /// Retrieve supporting passages for a query.
    ///
    /// The tenant id is mandatory; the relevance floor is applied after the
    /// retriever's own scoring, and ordering is normalized to
    /// score-descending before assembly.
    pub async fn retrieve(
        &self,
        tenant_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<RetrievalResult> {
        if tenant_id.is_empty() {
            return Err(Error::invalid_request("retrieval requires a tenant id"));
        }

        let started = Instant::now();
        let mut chunks = self
            .retriever
            .query(tenant_id, query, top_k)
            .await
            .map_err(|e| Error::Retrieval(e.to_string()))?;
        let total = chunks.len();

        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.retain(|c| c.score >= self.min_score);

        let context_string = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_DELIMITER);

        Ok(RetrievalResult {
            chunks,
            total,
            context_string,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRetriever {
        chunks: Vec<RetrievedChunk>,
        expect_tenant: &'static str,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn query(
            &self,
            tenant_id: &str,
            _text: &str,
            top_k: usize,
        ) -> Result<Vec<RetrievedChunk>> {
            assert_eq!(tenant_id, self.expect_tenant);
            Ok(self.chunks.iter().take(top_k).cloned().collect())
        }
    }

    fn chunk(id: &str, content: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            id: id.to_string(),
            content: content.to_string(),
            score,
            source: None,
        }
    }

    #[tokio::test]
    async fn test_filters_below_min_score_and_orders_descending() {
        let retriever = FixedRetriever {
            chunks: vec![
                chunk("a", "low relevance", 0.3),
                chunk("b", "high relevance", 0.9),
                chunk("c", "medium relevance", 0.6),
            ],
            expect_tenant: "tenant-1",
        };
        let adapter = RetrieverAdapter::new(Arc::new(retriever), 0.5);

        let result = adapter.retrieve("tenant-1", "query", 10).await.unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.chunks.len(), 2);
        assert_eq!(result.chunks[0].id, "b");
        assert_eq!(result.chunks[1].id, "c");
        // Monotone non-increasing scores.
        assert!(result.chunks.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_context_string_assembly() {
        let retriever = FixedRetriever {
            chunks: vec![chunk("a", "first passage", 0.9), chunk("b", "second passage", 0.8)],
            expect_tenant: "tenant-1",
        };
        let adapter = RetrieverAdapter::new(Arc::new(retriever), 0.5);

        let result = adapter.retrieve("tenant-1", "query", 10).await.unwrap();
        assert_eq!(
            result.context_string,
            format!("first passage{CONTEXT_DELIMITER}second passage")
        );
    }

    #[tokio::test]
    async fn test_missing_tenant_rejected() {
        let retriever = FixedRetriever {
            chunks: vec![],
            expect_tenant: "",
        };
        let adapter = RetrieverAdapter::new(Arc::new(retriever), 0.5);
        let err = adapter.retrieve("", "query", 10).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_empty_corpus_yields_empty_result() {
        let retriever = FixedRetriever {
            chunks: vec![],
            expect_tenant: "tenant-1",
        };
        let adapter = RetrieverAdapter::new(Arc::new(retriever), 0.5);
        let result = adapter.retrieve("tenant-1", "query", 10).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.context_string, "");
    }

    #[test]
    fn test_mean_score() {
        let result = RetrievalResult {
            chunks: vec![chunk("a", "x", 0.8), chunk("b", "y", 0.6)],
            total: 2,
            context_string: String::new(),
            elapsed_ms: 0,
        };
        assert!((result.mean_score() - 0.7).abs() < 1e-9);
        assert_eq!(RetrievalResult::empty().mean_score(), 0.0);
    }
}
