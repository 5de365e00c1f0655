//! Token-window chunking with page provenance.

use crate::error::{RagError, Result};
use crate::tokenizer::{Tokenizer, decode_prefix, first_char_end, next_char_start};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

static MARKER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##[A-Za-z]+").expect("marker pattern is valid"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Provenance of one chunk, stored row-aligned with the chunk text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_file: String,
    pub doc_id: String,
    /// Position of the chunk within its parent document.
    pub chunk_idx: usize,
    /// Only present for sources that had page boundaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// The text of a single page of a paginated source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
    #[serde(default)]
    pub text: String,
    #[serde(default = "first_page")]
    pub page: u32,
}

fn first_page() -> u32 {
    1
}

/// Page tag produced for each chunk of page-tagged input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTag {
    pub page: u32,
}

/// What the chunker accepts: one text blob, or page records.
#[derive(Debug, Clone, Copy)]
pub enum ChunkInput<'a> {
    Text(&'a str),
    Pages(&'a [PageText]),
}

/// Splits text into overlapping windows of `chunk_size` tokens.
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("chunk_size", &self.chunk_size)
            .field("overlap", &self.overlap)
            .field("tokenizer", &self.tokenizer.name())
            .finish()
    }
}

impl Chunker {
    /// Fails when the window would not advance (`overlap >= chunk_size`).
    pub fn new(chunk_size: usize, overlap: usize, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(RagError::invalid_input(format!(
                "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
            tokenizer,
        })
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Chunk either input shape.
    ///
    /// Plain text yields no per-chunk metadata. Page records are chunked one
    /// page at a time so that no chunk crosses a page boundary, and yield one
    /// [`PageTag`] per chunk.
    pub fn chunk(&self, input: ChunkInput<'_>) -> (Vec<String>, Vec<PageTag>) {
        match input {
            ChunkInput::Text(text) => (self.chunk_text(text), Vec::new()),
            ChunkInput::Pages(pages) => {
                let mut chunks = Vec::new();
                let mut tags = Vec::new();
                for page in pages {
                    let page_chunks = self.chunk_text(&page.text);
                    tags.extend(std::iter::repeat_n(
                        PageTag { page: page.page },
                        page_chunks.len(),
                    ));
                    chunks.extend(page_chunks);
                }
                (chunks, tags)
            }
        }
    }

    /// Chunk a single text unit.
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        let cleaned = normalize_text(text);
        if cleaned.is_empty() {
            return Vec::new();
        }

        let tokenizer = self.tokenizer.as_ref();
        let tokens = tokenizer.encode(&cleaned);
        let mut chunks = Vec::new();
        let mut start = 0;

        // Windows start and end on character boundaries, and each one starts
        // at or before the end of the previous one.
        while start < tokens.len() {
            let limit = (start + self.chunk_size).min(tokens.len());
            let Some((len, window)) = decode_prefix(tokenizer, &tokens[start..limit]) else {
                let skip = first_char_end(tokenizer, &tokens[start..]);
                tracing::warn!(
                    start,
                    tokens = skip,
                    chunk_size = self.chunk_size,
                    "Character needs more tokens than chunk_size, skipping it"
                );
                start += skip;
                continue;
            };
            if !window.trim().is_empty() {
                chunks.push(window);
            }

            let end = start + len;
            if end == tokens.len() {
                break;
            }
            let from = end.saturating_sub(self.overlap).max(start + 1);
            start += next_char_start(tokenizer, &tokens[start..end], from - start);
        }
        chunks
    }
}

/// Strip extraction marker tokens (`##word`) and collapse whitespace runs.
pub fn normalize_text(text: &str) -> String {
    let without_markers = MARKER_TOKEN.replace_all(text, "");
    WHITESPACE_RUN
        .replace_all(&without_markers, " ")
        .trim()
        .to_string()
}
