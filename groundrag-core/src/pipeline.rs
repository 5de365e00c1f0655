//! Request orchestration: rerank, generate, verify, cite.

use crate::chunk::ChunkMetadata;
use crate::citation::{Citation, CitationMapper};
use crate::config::RagConfig;
use crate::embeddings::{Embedder, create_embedder};
use crate::generator::{Generator, create_generator};
use crate::reranker::{Reranker, create_reranker};
use crate::verifier::{AnswerVerifier, SupportDetail};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Answer returned when no generator is configured.
pub const RETRIEVAL_ONLY_ANSWER: &str = "I found relevant information in the documents but no LLM \
     is connected to generate a natural language answer. Please see the citations below.";

/// Model handles shared by every request. Built once, then read-only.
#[derive(Clone)]
pub struct ModelContext {
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Option<Reranker>,
    pub generator: Option<Arc<dyn Generator>>,
}

impl ModelContext {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        reranker: Option<Reranker>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Self {
        Self {
            embedder,
            reranker,
            generator,
        }
    }

    pub fn from_config(config: &RagConfig) -> Self {
        let models = Self::new(
            create_embedder(&config.embedding),
            create_reranker(&config.retrieval),
            create_generator(&config.generation),
        );
        info!(
            embedder = models.embedder.provider_name(),
            reranker = models.reranker.as_ref().map(|r| r.scorer_name()).unwrap_or("none"),
            generator = models.generator.as_ref().map(|g| g.name()).unwrap_or("none"),
            "Model context ready"
        );
        models
    }
}

/// Per-request knobs taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub k_rerank: usize,
    pub use_reranker: bool,
    pub similarity_threshold: f32,
    pub confidence_threshold: f32,
    pub embedding_batch_size: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            k_rerank: config.retrieval.k_rerank,
            use_reranker: config.retrieval.use_reranker,
            similarity_threshold: config.verification.similarity_threshold,
            confidence_threshold: config.verification.confidence_threshold,
            embedding_batch_size: config.embedding.batch_size,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

/// Stage timings in milliseconds.
///
/// Each stage value is the time elapsed since the request started minus the
/// stages already accounted for, so `generation_ms` also covers reranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Latency {
    pub generation_ms: f64,
    pub verification_ms: f64,
    pub citation_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub answer: String,
    pub confidence: f32,
    pub citations: Vec<Citation>,
    /// Candidates as retrieved, before reranking.
    pub retrieved_chunks: Vec<String>,
    pub support_details: Vec<SupportDetail>,
    pub latency: Latency,
}

/// The answering pipeline. Holds one generator for its whole life.
pub struct RagSystem {
    models: ModelContext,
    verifier: AnswerVerifier,
    mapper: CitationMapper,
    settings: PipelineSettings,
}

impl RagSystem {
    pub fn new(models: ModelContext, settings: PipelineSettings) -> Self {
        let verifier = AnswerVerifier::new(
            Arc::clone(&models.embedder),
            settings.similarity_threshold,
            settings.embedding_batch_size,
        );
        let mapper = CitationMapper::new(
            Arc::clone(&models.embedder),
            settings.embedding_batch_size,
        );
        Self {
            models,
            verifier,
            mapper,
            settings,
        }
    }

    pub fn models(&self) -> &ModelContext {
        &self.models
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Answer `query` from retrieved `chunks` and their aligned `metadata`.
    pub async fn answer(
        &self,
        query: &str,
        chunks: &[String],
        metadata: &[ChunkMetadata],
    ) -> AnswerResult {
        let start = Instant::now();

        let reranker = self
            .models
            .reranker
            .as_ref()
            .filter(|_| self.settings.use_reranker);
        let (context, context_meta) = match reranker {
            Some(reranker) if !chunks.is_empty() => {
                let (reranked, indices) = reranker
                    .rerank(query, chunks, self.settings.k_rerank)
                    .await;
                let meta: Vec<ChunkMetadata> = indices
                    .iter()
                    .map_while(|&i| metadata.get(i).cloned())
                    .collect();
                (reranked, meta)
            }
            _ => (chunks.to_vec(), metadata.to_vec()),
        };
        debug!(
            retrieved = chunks.len(),
            context = context.len(),
            "Context selected"
        );

        let Some(generator) = &self.models.generator else {
            let elapsed = elapsed_ms(start);
            return AnswerResult {
                answer: RETRIEVAL_ONLY_ANSWER.to_string(),
                confidence: 1.0,
                citations: Vec::new(),
                retrieved_chunks: chunks.to_vec(),
                support_details: Vec::new(),
                latency: Latency {
                    generation_ms: elapsed,
                    verification_ms: 0.0,
                    citation_ms: 0.0,
                    total_ms: elapsed_ms(start),
                },
            };
        };

        let raw_answer = generator.generate(query, &context).await;
        let generation_ms = elapsed_ms(start);

        let verified = self
            .verifier
            .filter_answer(&raw_answer, &context, self.settings.confidence_threshold)
            .await;
        let verification_ms = elapsed_ms(start) - generation_ms;

        let citations = self
            .mapper
            .map_citations(&verified.answer, &context, &context_meta)
            .await;
        let citation_ms = elapsed_ms(start) - generation_ms - verification_ms;

        let latency = Latency {
            generation_ms,
            verification_ms,
            citation_ms,
            total_ms: elapsed_ms(start),
        };
        info!(
            generator = generator.name(),
            accepted = verified.accepted,
            confidence = verified.confidence,
            citations = citations.len(),
            total_ms = latency.total_ms,
            "Answered question"
        );

        AnswerResult {
            answer: verified.answer,
            confidence: verified.confidence,
            citations,
            retrieved_chunks: chunks.to_vec(),
            support_details: verified.support_details,
            latency,
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
