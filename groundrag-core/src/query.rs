//! Question answering against the loaded index.

use crate::error::{RagError, Result};
use crate::index::IndexStore;
use crate::pipeline::{AnswerResult, RagSystem};
use std::sync::Arc;
use tracing::debug;

/// Embeds a question, retrieves candidates from the current index snapshot
/// and runs the answering pipeline over them.
pub struct QueryService {
    store: Arc<IndexStore>,
    rag: Arc<RagSystem>,
    k_retrieve: usize,
}

impl QueryService {
    pub fn new(store: Arc<IndexStore>, rag: Arc<RagSystem>, k_retrieve: usize) -> Self {
        Self {
            store,
            rag,
            k_retrieve,
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub async fn ask(&self, question: &str) -> Result<AnswerResult> {
        self.ask_with_k(question, self.k_retrieve).await
    }

    /// Fails with `InvalidInput` when no index is loaded.
    pub async fn ask_with_k(&self, question: &str, k_retrieve: usize) -> Result<AnswerResult> {
        if question.trim().is_empty() {
            return Err(RagError::invalid_input("question is empty"));
        }
        let snapshot = self
            .store
            .current()
            .ok_or_else(|| RagError::invalid_input("index not built"))?;

        let query_vec = self.rag.models().embedder.embed_one(question).await?;
        let retrieved = snapshot.retrieve(&query_vec, k_retrieve)?;
        debug!(
            k = k_retrieve,
            hits = retrieved.chunks.len(),
            generation = %snapshot.generation(),
            "Retrieved candidates"
        );

        Ok(self
            .rag
            .answer(question, &retrieved.chunks, &retrieved.metadata)
            .await)
    }
}
