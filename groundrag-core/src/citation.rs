//! Attribution of answer sentences to source chunks.

use crate::chunk::ChunkMetadata;
use crate::embeddings::{Embedder, best_match};
use crate::verifier::split_sentences;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

const UNKNOWN_SOURCE: &str = "Unknown";

/// Page of a citation. Serialized as the page number, or `"N/A"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRef {
    Page(u32),
    NotAvailable,
}

impl From<Option<u32>> for PageRef {
    fn from(page: Option<u32>) -> Self {
        page.map_or(Self::NotAvailable, Self::Page)
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(n) => write!(f, "{n}"),
            Self::NotAvailable => f.write_str("N/A"),
        }
    }
}

impl Serialize for PageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Page(n) => serializer.serialize_u32(*n),
            Self::NotAvailable => serializer.serialize_str("N/A"),
        }
    }
}

impl<'de> Deserialize<'de> for PageRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
            Null(()),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self::Page(n),
            Raw::Text(s) => s.parse().map_or(Self::NotAvailable, Self::Page),
            Raw::Null(()) => Self::NotAvailable,
        })
    }
}

/// Source attribution of one answer sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub sentence: String,
    pub source_file: String,
    pub page: PageRef,
    pub similarity: f32,
}

pub struct CitationMapper {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl CitationMapper {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Cite each sentence of `answer` to its most similar chunk.
    ///
    /// `metadata` is aligned with `chunks`; a chunk without metadata is cited
    /// as an unknown source. Returns nothing for an empty chunk set or when
    /// embedding fails.
    pub async fn map_citations(
        &self,
        answer: &str,
        chunks: &[String],
        metadata: &[ChunkMetadata],
    ) -> Vec<Citation> {
        let sentences = split_sentences(answer);
        if chunks.is_empty() || sentences.is_empty() {
            return Vec::new();
        }

        let embedded = async {
            let sentence_vecs = self.embedder.embed(&sentences, self.batch_size).await?;
            let chunk_vecs = self.embedder.embed(chunks, self.batch_size).await?;
            Ok::<_, crate::error::RagError>((sentence_vecs, chunk_vecs))
        }
        .await;
        let (sentence_vecs, chunk_vecs) = match embedded {
            Ok(vecs) => vecs,
            Err(e) => {
                warn!(error = %e, "Could not embed for citation mapping, returning no citations");
                return Vec::new();
            }
        };

        sentences
            .into_iter()
            .zip(&sentence_vecs)
            .filter_map(|(sentence, vec)| {
                let (best, score) = best_match(vec, &chunk_vecs)?;
                let meta = metadata.get(best);
                Some(Citation {
                    sentence,
                    source_file: meta
                        .map(|m| m.source_file.clone())
                        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
                    page: meta.and_then(|m| m.page).into(),
                    similarity: score.clamp(0.0, 1.0),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;

    fn mapper() -> CitationMapper {
        CitationMapper::new(Arc::new(LocalEmbedder::new(384)), 16)
    }

    fn meta(file: &str, idx: usize, page: Option<u32>) -> ChunkMetadata {
        ChunkMetadata {
            source_file: file.into(),
            doc_id: file.into(),
            chunk_idx: idx,
            page,
        }
    }

    #[tokio::test]
    async fn test_cites_best_chunk_per_sentence() {
        let chunks = vec![
            "Paris is the capital of France.".to_string(),
            "The sky is blue.".to_string(),
        ];
        let metadata = vec![meta("france.pdf", 0, Some(3)), meta("weather.txt", 0, None)];
        let citations = mapper()
            .map_citations("The sky is blue. Paris is in France.", &chunks, &metadata)
            .await;

        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].source_file, "weather.txt");
        assert_eq!(citations[0].page, PageRef::NotAvailable);
        assert!((citations[0].similarity - 1.0).abs() < 1e-5);
        assert_eq!(citations[1].source_file, "france.pdf");
        assert_eq!(citations[1].page, PageRef::Page(3));
    }

    #[tokio::test]
    async fn test_empty_chunks_yield_no_citations() {
        assert!(mapper().map_citations("Anything.", &[], &[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_metadata_defaults() {
        let chunks = vec!["The sky is blue.".to_string()];
        let citations = mapper().map_citations("The sky is blue.", &chunks, &[]).await;
        assert_eq!(citations[0].source_file, "Unknown");
        assert_eq!(citations[0].page, PageRef::NotAvailable);
    }

    #[test]
    fn test_page_ref_serde() {
        assert_eq!(serde_json::to_string(&PageRef::Page(4)).unwrap(), "4");
        assert_eq!(serde_json::to_string(&PageRef::NotAvailable).unwrap(), "\"N/A\"");
        assert_eq!(serde_json::from_str::<PageRef>("7").unwrap(), PageRef::Page(7));
        assert_eq!(
            serde_json::from_str::<PageRef>("\"N/A\"").unwrap(),
            PageRef::NotAvailable
        );
        assert_eq!(
            serde_json::from_str::<PageRef>("null").unwrap(),
            PageRef::NotAvailable
        );
    }
}
