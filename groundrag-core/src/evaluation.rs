//! Offline answer-quality evaluation against reference answers.

use crate::error::Result;
use crate::pipeline::PipelineSettings;
use crate::query::QueryService;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// One question of a test set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub q_id: Option<serde_json::Value>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub reference_answer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetrics {
    /// Share of distinct answer tokens found in the reference.
    pub precision: f64,
    /// Share of distinct reference tokens found in the answer.
    pub recall: f64,
    pub rouge_l: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRecord {
    pub q_id: Option<serde_json::Value>,
    pub question: String,
    pub answer: String,
    pub reference: String,
    pub confidence: f32,
    pub metrics: AnswerMetrics,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSummary {
    pub baseline: bool,
    pub evaluated: usize,
    pub skipped: usize,
    pub mean_confidence: f64,
    pub mean_precision: f64,
    pub mean_recall: f64,
    pub mean_rouge_l: f64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub summary: EvalSummary,
    pub results: Vec<EvalRecord>,
}

pub fn load_test_set(path: &Path) -> Result<Vec<TestCase>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Settings for a baseline run: no reranking and every answer accepted.
pub fn baseline_settings(settings: PipelineSettings) -> PipelineSettings {
    PipelineSettings {
        use_reranker: false,
        confidence_threshold: 0.0,
        ..settings
    }
}

/// Token-set precision and recall over lower-cased whitespace tokens.
pub fn token_overlap(generated: &str, reference: &str) -> (f64, f64) {
    let generated = generated.to_lowercase();
    let reference = reference.to_lowercase();
    let gen_tokens: HashSet<&str> = generated.split_whitespace().collect();
    let ref_tokens: HashSet<&str> = reference.split_whitespace().collect();
    if gen_tokens.is_empty() || ref_tokens.is_empty() {
        return (0.0, 0.0);
    }
    let overlap = gen_tokens.intersection(&ref_tokens).count() as f64;
    (
        overlap / gen_tokens.len() as f64,
        overlap / ref_tokens.len() as f64,
    )
}

fn rouge_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// ROUGE-L F-measure from the longest common token subsequence.
pub fn rouge_l(generated: &str, reference: &str) -> f64 {
    let candidate = rouge_tokens(generated);
    let target = rouge_tokens(reference);
    if candidate.is_empty() || target.is_empty() {
        return 0.0;
    }
    let lcs = lcs_len(&candidate, &target) as f64;
    if lcs == 0.0 {
        return 0.0;
    }
    let precision = lcs / candidate.len() as f64;
    let recall = lcs / target.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

pub fn score_answer(generated: &str, reference: &str) -> AnswerMetrics {
    let (precision, recall) = token_overlap(generated, reference);
    AnswerMetrics {
        precision,
        recall,
        rouge_l: rouge_l(generated, reference),
    }
}

/// Run every case through `service`. Cases without a question, and cases
/// whose query fails, are counted as skipped.
pub async fn evaluate(service: &QueryService, cases: &[TestCase], baseline: bool) -> EvalReport {
    let mut results = Vec::with_capacity(cases.len());
    let mut skipped = 0;

    for case in cases {
        if case.question.trim().is_empty() {
            skipped += 1;
            continue;
        }
        match service.ask(&case.question).await {
            Ok(response) => {
                let metrics = score_answer(&response.answer, &case.reference_answer);
                info!(
                    confidence = response.confidence,
                    rouge_l = metrics.rouge_l,
                    "Evaluated question"
                );
                results.push(EvalRecord {
                    q_id: case.q_id.clone(),
                    question: case.question.clone(),
                    answer: response.answer,
                    reference: case.reference_answer.clone(),
                    confidence: response.confidence,
                    metrics,
                    latency_ms: response.latency.total_ms,
                });
            }
            Err(e) => {
                warn!(question = %case.question, error = %e, "Evaluation query failed");
                skipped += 1;
            }
        }
    }

    EvalReport {
        summary: summarize(&results, skipped, baseline),
        results,
    }
}

fn mean(results: &[EvalRecord], value: impl Fn(&EvalRecord) -> f64) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(value).sum::<f64>() / results.len() as f64
}

fn summarize(results: &[EvalRecord], skipped: usize, baseline: bool) -> EvalSummary {
    EvalSummary {
        baseline,
        evaluated: results.len(),
        skipped,
        mean_confidence: mean(results, |r| r.confidence as f64),
        mean_precision: mean(results, |r| r.metrics.precision),
        mean_recall: mean(results, |r| r.metrics.recall),
        mean_rouge_l: mean(results, |r| r.metrics.rouge_l),
        mean_latency_ms: mean(results, |r| r.latency_ms),
    }
}
