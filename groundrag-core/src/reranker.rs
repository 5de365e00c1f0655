//! Second-pass relevance scoring of retrieval candidates.

use crate::config::RetrievalConfig;
use crate::embeddings::content_terms;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Scores `(query, passage)` pairs. Higher is more relevant.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// One score per passage, in passage order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Reranker
// ---------------------------------------------------------------------------

/// Reorders candidates by relevance and keeps the best `top_k`.
#[derive(Clone)]
pub struct Reranker {
    scorer: Arc<dyn RelevanceScorer>,
}

impl std::fmt::Debug for Reranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reranker")
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self { scorer }
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    /// Returns the chosen chunks and their positions in `chunks`.
    ///
    /// Sorting is stable, so equal scores keep retrieval order. If the
    /// scorer fails the retrieval order is kept and truncated to `top_k`.
    pub async fn rerank(
        &self,
        query: &str,
        chunks: &[String],
        top_k: usize,
    ) -> (Vec<String>, Vec<usize>) {
        if chunks.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let mut order: Vec<(usize, f32)> = match self.scorer.score(query, chunks).await {
            Ok(scores) if scores.len() == chunks.len() => scores.into_iter().enumerate().collect(),
            Ok(scores) => {
                warn!(
                    scorer = self.scorer.name(),
                    expected = chunks.len(),
                    got = scores.len(),
                    "Scorer returned the wrong number of scores, keeping retrieval order"
                );
                (0..chunks.len()).map(|i| (i, 0.0)).collect()
            }
            Err(e) => {
                warn!(
                    scorer = self.scorer.name(),
                    error = %e,
                    "Reranking failed, keeping retrieval order"
                );
                (0..chunks.len()).map(|i| (i, 0.0)).collect()
            }
        };

        order.sort_by(|a, b| b.1.total_cmp(&a.1));
        order.truncate(top_k);
        debug!(
            scorer = self.scorer.name(),
            candidates = chunks.len(),
            kept = order.len(),
            "Reranked candidates"
        );

        let indices: Vec<usize> = order.iter().map(|(i, _)| *i).collect();
        let reordered = indices.iter().map(|&i| chunks[i].clone()).collect();
        (reordered, indices)
    }
}

/// Build the configured reranker, or `None` when reranking is disabled.
pub fn create_reranker(config: &RetrievalConfig) -> Option<Reranker> {
    if !config.use_reranker {
        return None;
    }
    let scorer: Arc<dyn RelevanceScorer> = match (config.reranker.as_str(), &config.reranker_url) {
        ("cross-encoder", Some(url)) => Arc::new(CrossEncoderScorer::new(url.clone())),
        ("cross-encoder", None) => {
            warn!("Cross-encoder reranker has no reranker_url, using lexical scoring");
            Arc::new(LexicalScorer::default())
        }
        ("lexical", _) => Arc::new(LexicalScorer::default()),
        (other, _) => {
            warn!(reranker = %other, "Unknown reranker, using lexical scoring");
            Arc::new(LexicalScorer::default())
        }
    };
    Some(Reranker::new(scorer))
}

// ---------------------------------------------------------------------------
// Lexical (BM25 over the candidate set)
// ---------------------------------------------------------------------------

/// Offline BM25 scorer. The candidate set is its own corpus for IDF and
/// average length.
#[derive(Debug, Clone)]
pub struct LexicalScorer {
    pub k1: f32,
    pub b: f32,
}

impl Default for LexicalScorer {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl LexicalScorer {
    fn score_sync(&self, query: &str, passages: &[String]) -> Vec<f32> {
        let query_terms: HashSet<String> = content_terms(query).into_iter().collect();
        let docs: Vec<Vec<String>> = passages.iter().map(|p| content_terms(p)).collect();

        let n = docs.len() as f32;
        let avg_len = (docs.iter().map(Vec::len).sum::<usize>() as f32 / n).max(1.0);

        let mut df: HashMap<&str, usize> = HashMap::new();
        for doc in &docs {
            let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
            for term in unique {
                *df.entry(term).or_insert(0) += 1;
            }
        }

        docs.iter()
            .map(|doc| {
                let mut tf: HashMap<&str, usize> = HashMap::new();
                for term in doc {
                    *tf.entry(term.as_str()).or_insert(0) += 1;
                }
                let len_norm = 1.0 - self.b + self.b * doc.len() as f32 / avg_len;
                query_terms
                    .iter()
                    .filter_map(|term| {
                        let freq = *tf.get(term.as_str())? as f32;
                        let docs_with = *df.get(term.as_str()).unwrap_or(&0) as f32;
                        let idf = (1.0 + (n - docs_with + 0.5) / (docs_with + 0.5)).ln();
                        Some(idf * freq * (self.k1 + 1.0) / (freq + self.k1 * len_norm))
                    })
                    .sum()
            })
            .collect()
    }
}

#[async_trait]
impl RelevanceScorer for LexicalScorer {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        Ok(self.score_sync(query, passages))
    }

    fn name(&self) -> &str {
        "lexical"
    }
}

// ---------------------------------------------------------------------------
// Remote cross-encoder
// ---------------------------------------------------------------------------

/// Cross-encoder served by a text-embeddings-inference compatible `/rerank`
/// endpoint.
pub struct CrossEncoderScorer {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

impl CrossEncoderScorer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RelevanceScorer for CrossEncoderScorer {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let url = format!("{}/rerank", self.base_url.trim_end_matches('/'));
        let body = json!({
            "query": query,
            "texts": passages,
        });
        debug!(url = %url, count = passages.len(), "Requesting cross-encoder scores");

        let hits: Vec<RerankHit> = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut scores = vec![None; passages.len()];
        for hit in hits {
            if let Some(slot) = scores.get_mut(hit.index) {
                *slot = Some(hit.score);
            }
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| {
                    RagError::model_unavailable(
                        "cross-encoder",
                        format!("no score for passage {i}"),
                    )
                })
            })
            .collect()
    }

    fn name(&self) -> &str {
        "cross-encoder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedScorer {
        scores: Vec<f32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RelevanceScorer for FixedScorer {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct FailingScorer;

    #[async_trait]
    impl RelevanceScorer for FailingScorer {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            Err(RagError::model_unavailable("reranker", "offline"))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sorts_descending_and_reports_indices() {
        let scorer = Arc::new(FixedScorer {
            scores: vec![0.1, 0.9, 0.5],
            calls: AtomicUsize::new(0),
        });
        let reranker = Reranker::new(scorer);
        let (chunks, idx) = reranker.rerank("q", &texts(&["a", "b", "c"]), 2).await;
        assert_eq!(chunks, texts(&["b", "c"]));
        assert_eq!(idx, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_ties_keep_retrieval_order() {
        let scorer = Arc::new(FixedScorer {
            scores: vec![0.5, 0.7, 0.5, 0.7],
            calls: AtomicUsize::new(0),
        });
        let (_, idx) = Reranker::new(scorer)
            .rerank("q", &texts(&["a", "b", "c", "d"]), 10)
            .await;
        assert_eq!(idx, vec![1, 3, 0, 2]);
    }

    #[tokio::test]
    async fn test_empty_input_skips_scorer() {
        let scorer = Arc::new(FixedScorer {
            scores: vec![],
            calls: AtomicUsize::new(0),
        });
        let reranker = Reranker::new(scorer.clone());
        let (chunks, idx) = reranker.rerank("q", &[], 5).await;
        assert!(chunks.is_empty() && idx.is_empty());
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_scorer_keeps_order() {
        let (chunks, idx) = Reranker::new(Arc::new(FailingScorer))
            .rerank("q", &texts(&["a", "b", "c"]), 2)
            .await;
        assert_eq!(chunks, texts(&["a", "b"]));
        assert_eq!(idx, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_lexical_prefers_matching_passage() {
        let passages = texts(&[
            "The sky is blue.",
            "Berlin is the capital of Germany.",
            "Paris is the capital of France.",
        ]);
        let (chunks, idx) = Reranker::new(Arc::new(LexicalScorer::default()))
            .rerank("What is the capital of France?", &passages, 2)
            .await;
        assert_eq!(idx, vec![2, 1]);
        assert_eq!(chunks[0], "Paris is the capital of France.");
    }

    #[test]
    fn test_create_reranker_respects_flag() {
        let mut config = RetrievalConfig::default();
        assert_eq!(create_reranker(&config).unwrap().scorer_name(), "lexical");
        config.reranker = "cross-encoder".into();
        assert_eq!(create_reranker(&config).unwrap().scorer_name(), "lexical");
        config.reranker_url = Some("http://localhost:8080".into());
        assert_eq!(
            create_reranker(&config).unwrap().scorer_name(),
            "cross-encoder"
        );
        config.use_reranker = false;
        assert!(create_reranker(&config).is_none());
    }
}
