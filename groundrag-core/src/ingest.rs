//! Index rebuilds from a document corpus.

use crate::chunk::{ChunkInput, ChunkMetadata, Chunker, PageText};
use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::index::{FlatIndex, IndexArtifact};
use crate::tokenizer::BpeTokenizer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A stored document as handed over for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub original_filename: String,
    /// Plain text, or a JSON array of `{text, page}` records.
    pub content: String,
}

/// Parsed form of [`SourceDocument::content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentContent {
    Text(String),
    Pages(Vec<PageText>),
}

impl DocumentContent {
    /// Content that looks like a JSON array and parses as page records is
    /// paginated; anything else is plain text.
    pub fn parse(content: &str) -> Self {
        if content.trim_start().starts_with('[')
            && let Ok(pages) = serde_json::from_str::<Vec<PageText>>(content)
        {
            return Self::Pages(pages);
        }
        Self::Text(content.to_string())
    }

    fn as_input(&self) -> ChunkInput<'_> {
        match self {
            Self::Text(text) => ChunkInput::Text(text),
            Self::Pages(pages) => ChunkInput::Pages(pages),
        }
    }
}

/// Chunks produced for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub doc_id: String,
    pub source_file: String,
    pub chunk_count: usize,
}

/// Everything a rebuild produced.
#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    pub artifact: IndexArtifact,
    pub chunk_count: usize,
    pub documents: Vec<DocumentStats>,
}

/// Chunks, embeds and indexes a corpus.
pub struct IndexBuilder {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            chunker,
            embedder,
            batch_size,
        }
    }

    pub fn from_config(config: &RagConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let tokenizer = BpeTokenizer::from_encoding(&config.chunking.tokenizer)?;
        let chunker = Chunker::new(
            config.chunking.chunk_size,
            config.chunking.overlap,
            Arc::new(tokenizer),
        )?;
        Ok(Self::new(chunker, embedder, config.embedding.batch_size))
    }

    /// Build a fresh artifact from `documents`. Fails on a corpus that yields
    /// no chunks at all.
    pub async fn rebuild(&self, documents: &[SourceDocument]) -> Result<RebuildOutcome> {
        let mut chunks = Vec::new();
        let mut metadata = Vec::new();
        let mut stats = Vec::with_capacity(documents.len());

        for doc in documents {
            let content = DocumentContent::parse(&doc.content);
            let (doc_chunks, tags) = self.chunker.chunk(content.as_input());
            debug!(doc_id = %doc.id, chunks = doc_chunks.len(), "Chunked document");

            for (i, text) in doc_chunks.iter().enumerate() {
                metadata.push(ChunkMetadata {
                    source_file: doc.original_filename.clone(),
                    doc_id: doc.id.clone(),
                    chunk_idx: i,
                    page: tags.get(i).map(|t| t.page),
                });
                chunks.push(text.clone());
            }
            stats.push(DocumentStats {
                doc_id: doc.id.clone(),
                source_file: doc.original_filename.clone(),
                chunk_count: doc_chunks.len(),
            });
        }

        if chunks.is_empty() {
            return Err(RagError::invalid_input("no indexable text in the corpus"));
        }

        let embeddings = self.embedder.embed(&chunks, self.batch_size).await?;
        let index = FlatIndex::build(&embeddings)?;
        let chunk_count = chunks.len();
        let artifact = IndexArtifact::new(index, chunks, metadata)?;
        info!(
            documents = documents.len(),
            chunks = chunk_count,
            embedder = self.embedder.provider_name(),
            generation = %artifact.generation(),
            "Rebuilt index"
        );

        Ok(RebuildOutcome {
            artifact,
            chunk_count,
            documents: stats,
        })
    }

    /// Rebuild and persist to `dir`.
    pub async fn rebuild_and_save(
        &self,
        documents: &[SourceDocument],
        dir: &Path,
    ) -> Result<RebuildOutcome> {
        let outcome = self.rebuild(documents).await?;
        outcome.artifact.save(dir)?;
        Ok(outcome)
    }
}
