//! Sentence-level grounding checks.
//!
//! Every answer sentence is compared against every context chunk in embedding
//! space. The answer's confidence is the fraction of its sentences whose best
//! chunk similarity clears the similarity threshold; answers below the
//! confidence threshold are replaced with [`REFUSAL`].

use crate::embeddings::{Embedder, best_match};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

/// Shown instead of an answer the context does not support.
pub const REFUSAL: &str = "I cannot find sufficient evidence in the documents.";

/// Grounding of a single answer sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportDetail {
    pub sentence: String,
    pub max_similarity: f32,
    pub is_supported: bool,
}

/// Result of [`AnswerVerifier::check_grounding`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingReport {
    /// Supported sentences over total sentences, in `[0, 1]`.
    pub confidence: f32,
    pub support_details: Vec<SupportDetail>,
}

/// Result of [`AnswerVerifier::filter_answer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedAnswer {
    /// The original answer, or [`REFUSAL`].
    pub answer: String,
    pub accepted: bool,
    pub confidence: f32,
    pub support_details: Vec<SupportDetail>,
}

/// Split text into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct AnswerVerifier {
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f32,
    batch_size: usize,
}

impl AnswerVerifier {
    pub fn new(embedder: Arc<dyn Embedder>, similarity_threshold: f32, batch_size: usize) -> Self {
        Self {
            embedder,
            similarity_threshold,
            batch_size: batch_size.max(1),
        }
    }

    /// Score how well `answer` is supported by `chunks`.
    ///
    /// No chunks or no sentences gives a zero report. An embedding failure
    /// also gives a zero report, so an answer that cannot be checked is never
    /// accepted.
    pub async fn check_grounding(&self, answer: &str, chunks: &[String]) -> GroundingReport {
        let sentences = split_sentences(answer);
        if chunks.is_empty() || sentences.is_empty() {
            return GroundingReport::default();
        }

        let sentence_vecs = match self.embedder.embed(&sentences, self.batch_size).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    error = %e,
                    "Could not embed answer sentences, treating answer as unsupported"
                );
                return GroundingReport::default();
            }
        };
        let chunk_vecs = match self.embedder.embed(chunks, self.batch_size).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Could not embed context chunks, treating answer as unsupported");
                return GroundingReport::default();
            }
        };

        let support_details: Vec<SupportDetail> = sentences
            .into_iter()
            .zip(&sentence_vecs)
            .map(|(sentence, vec)| {
                let max_similarity = best_match(vec, &chunk_vecs)
                    .map(|(_, score)| score.clamp(0.0, 1.0))
                    .unwrap_or(0.0);
                SupportDetail {
                    sentence,
                    max_similarity,
                    is_supported: max_similarity > self.similarity_threshold,
                }
            })
            .collect();

        let supported = support_details.iter().filter(|d| d.is_supported).count();
        let confidence = supported as f32 / support_details.len() as f32;
        debug!(
            sentences = support_details.len(),
            supported,
            confidence,
            "Checked answer grounding"
        );
        GroundingReport {
            confidence,
            support_details,
        }
    }

    /// Keep `answer` when its confidence reaches `confidence_threshold`,
    /// otherwise replace it with [`REFUSAL`]. The computed confidence and
    /// details are returned either way.
    pub async fn filter_answer(
        &self,
        answer: &str,
        chunks: &[String],
        confidence_threshold: f32,
    ) -> VerifiedAnswer {
        let report = self.check_grounding(answer, chunks).await;
        let accepted = report.confidence >= confidence_threshold;
        if !accepted {
            debug!(
                confidence = report.confidence,
                threshold = confidence_threshold,
                "Answer rejected as ungrounded"
            );
        }
        VerifiedAnswer {
            answer: if accepted {
                answer.to_string()
            } else {
                REFUSAL.to_string()
            },
            accepted,
            confidence: report.confidence,
            support_details: report.support_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::error::{RagError, Result};
    use async_trait::async_trait;

    fn verifier(threshold: f32) -> AnswerVerifier {
        AnswerVerifier::new(Arc::new(LocalEmbedder::new(384)), threshold, 32)
    }

    fn corpus() -> Vec<String> {
        vec![
            "Paris is the capital of France.".into(),
            "Berlin is the capital of Germany.".into(),
            "The sky is blue.".into(),
        ]
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(RagError::model_unavailable("embedder", "down"))
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn provider_name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("First one. Second one!  Third?"),
            vec!["First one.", "Second one!", "Third?"]
        );
        assert!(split_sentences("   ").is_empty());
    }

    #[tokio::test]
    async fn test_no_chunks_is_zero() {
        let report = verifier(0.1).check_grounding("Paris is nice.", &[]).await;
        assert_eq!(report, GroundingReport::default());
    }

    #[tokio::test]
    async fn test_no_sentences_is_zero() {
        let report = verifier(0.1).check_grounding("  ", &corpus()).await;
        assert_eq!(report.confidence, 0.0);
        assert!(report.support_details.is_empty());
    }

    #[tokio::test]
    async fn test_confidence_is_supported_fraction() {
        let report = verifier(0.5)
            .check_grounding(
                "Paris is the capital of France. The moon is made of cheese.",
                &corpus(),
            )
            .await;
        assert_eq!(report.support_details.len(), 2);
        assert!(report.support_details[0].is_supported);
        assert!(!report.support_details[1].is_supported);
        assert_eq!(report.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_filter_accepts_grounded_answer_unchanged() {
        let answer = "Paris is the capital of France.";
        let verified = verifier(0.5).filter_answer(answer, &corpus(), 0.7).await;
        assert!(verified.accepted);
        assert_eq!(verified.answer, answer);
        assert_eq!(verified.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_filter_refuses_but_keeps_details() {
        let verified = verifier(0.5)
            .filter_answer("The moon is made of cheese.", &corpus(), 0.7)
            .await;
        assert!(!verified.accepted);
        assert_eq!(verified.answer, REFUSAL);
        assert_eq!(verified.confidence, 0.0);
        assert_eq!(verified.support_details.len(), 1);
        assert_eq!(verified.support_details[0].sentence, "The moon is made of cheese.");
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_closed() {
        let verifier = AnswerVerifier::new(Arc::new(BrokenEmbedder), 0.1, 8);
        let verified = verifier
            .filter_answer("Paris is the capital of France.", &corpus(), 0.5)
            .await;
        assert_eq!(verified.answer, REFUSAL);
        assert_eq!(verified.confidence, 0.0);
    }
}
