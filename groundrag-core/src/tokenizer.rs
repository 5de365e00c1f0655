//! Token encoding used to size chunk windows.

use crate::error::{RagError, Result};

/// Encodes text to token ids and back.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn decode(&self, tokens: &[u32]) -> Result<String>;

    fn name(&self) -> &str;
}

/// Byte-pair tokenizer backed by `tiktoken-rs`.
pub struct BpeTokenizer {
    bpe: tiktoken_rs::CoreBPE,
    name: String,
}

impl BpeTokenizer {
    /// Load one of the bundled encodings by name.
    pub fn from_encoding(name: &str) -> Result<Self> {
        let bpe = match name {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => {
                return Err(RagError::tokenizer(format!("unknown encoding '{other}'")));
            }
        }
        .map_err(|e| RagError::tokenizer(format!("failed to load {name}: {e}")))?;
        Ok(Self {
            bpe,
            name: name.to_string(),
        })
    }

    pub fn cl100k() -> Result<Self> {
        Self::from_encoding("cl100k_base")
    }
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("name", &self.name)
            .finish()
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| RagError::tokenizer(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decode the longest prefix of `tokens` that ends on a character boundary.
///
/// `tokens` must start on a boundary. Returns the prefix length with its text,
/// or `None` when no complete character fits.
pub fn decode_prefix(tokenizer: &dyn Tokenizer, tokens: &[u32]) -> Option<(usize, String)> {
    (1..=tokens.len())
        .rev()
        .find_map(|end| tokenizer.decode(&tokens[..end]).ok().map(|text| (end, text)))
}

/// Length of the shortest prefix of `tokens` that holds a whole character.
///
/// `tokens` must start on a boundary. Falls back to the full length.
pub fn first_char_end(tokenizer: &dyn Tokenizer, tokens: &[u32]) -> usize {
    (1..=tokens.len())
        .find(|&end| tokenizer.decode(&tokens[..end]).is_ok())
        .unwrap_or(tokens.len())
}

/// First position at or after `from` where a character starts, given that
/// `tokens` ends on a boundary. Returns `tokens.len()` when there is none.
pub fn next_char_start(tokenizer: &dyn Tokenizer, tokens: &[u32], from: usize) -> usize {
    (from..tokens.len())
        .find(|&start| tokenizer.decode(&tokens[start..]).is_ok())
        .unwrap_or(tokens.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_ascii() {
        let tok = BpeTokenizer::cl100k().unwrap();
        let ids = tok.encode("Paris is the capital of France.");
        assert!(!ids.is_empty());
        assert_eq!(tok.decode(&ids).unwrap(), "Paris is the capital of France.");
        assert_eq!(tok.name(), "cl100k_base");
    }

    #[test]
    fn test_unknown_encoding() {
        let err = BpeTokenizer::from_encoding("nope").unwrap_err();
        assert!(matches!(err, RagError::Tokenizer { .. }));
    }

    #[test]
    fn test_decode_prefix_stops_on_character_boundary() {
        let tok = BpeTokenizer::cl100k().unwrap();
        let text = "日本語のテキスト 🦀🦀🦀 end";
        let ids = tok.encode(text);
        for limit in 1..=ids.len() {
            if let Some((end, prefix)) = decode_prefix(&tok, &ids[..limit]) {
                assert!(end <= limit);
                assert!(text.starts_with(&prefix));
            }
        }
        assert_eq!(decode_prefix(&tok, &ids).unwrap(), (ids.len(), text.to_string()));
    }

    #[test]
    fn test_char_boundaries_of_emoji() {
        let tok = BpeTokenizer::cl100k().unwrap();
        let text = "🦀🦀";
        let ids = tok.encode(text);

        let first = first_char_end(&tok, &ids);
        let head = tok.decode(&ids[..first]).unwrap();
        assert!(!head.is_empty() && text.starts_with(&head));

        let start = next_char_start(&tok, &ids, 1);
        assert!(start >= 1 && start <= ids.len());
        assert!(text.ends_with(&tok.decode(&ids[start..]).unwrap()));
        assert_eq!(next_char_start(&tok, &ids, ids.len()), ids.len());
    }
}
