//! # groundrag-core: grounded question answering over a private corpus
//!
//! Documents are chunked into overlapping token windows, embedded, and kept in
//! an exact flat vector index. A question retrieves candidate chunks, which are
//! reranked and handed to a generator. Every sentence of the generated answer
//! is then checked against the context it was given: answers whose sentences
//! are not supported are replaced with a refusal, and the text actually shown
//! is attributed sentence by sentence to its source chunks.

// Foundation
pub mod config;
pub mod error;

// Text and vectors
pub mod chunk;
pub mod embeddings;
pub mod index;
pub mod tokenizer;

// Answering
pub mod citation;
pub mod generator;
pub mod pipeline;
pub mod reranker;
pub mod verifier;

// Entry points
pub mod evaluation;
pub mod ingest;
pub mod query;

// Re-exports
pub use chunk::{ChunkInput, ChunkMetadata, Chunker, PageText};
pub use citation::{Citation, CitationMapper, PageRef};
pub use config::{RagConfig, load_config};
pub use embeddings::{Embedder, LocalEmbedder, cosine_similarity, create_embedder};
pub use error::{RagError, Result};
pub use generator::{Generator, LocalGenerator, RemoteGenerator, create_generator};
pub use index::{FlatIndex, IndexArtifact, IndexStatus, IndexStore, SearchHits};
pub use ingest::{DocumentContent, IndexBuilder, RebuildOutcome, SourceDocument};
pub use pipeline::{AnswerResult, Latency, ModelContext, PipelineSettings, RagSystem};
pub use query::QueryService;
pub use reranker::{Reranker, RelevanceScorer};
pub use verifier::{AnswerVerifier, GroundingReport, REFUSAL, SupportDetail, VerifiedAnswer};
