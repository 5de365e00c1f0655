//! Error types for the groundrag-core crate.
//!
//! Component boundaries (generator, verifier, citation mapper) convert their
//! expected failure modes into sentinel values, so most of these variants only
//! surface from index loading, rebuilds and configuration.

use std::path::PathBuf;

/// Top-level error type for retrieval and verification operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Corrupt index artifact at {path}: {message}")]
    CorruptArtifact { path: PathBuf, message: String },

    #[error("Model unavailable ({capability}): {message}")]
    ModelUnavailable { capability: String, message: String },

    #[error("Generation failed: {message}")]
    Generation { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Tokenizer error: {message}")]
    Tokenizer { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RagError {
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn model_unavailable(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            capability: capability.into(),
            message: message.into(),
        }
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn tokenizer(message: impl Into<String>) -> Self {
        Self::Tokenizer {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_artifact_display() {
        let err = RagError::corrupt("/tmp/index", "chunks.json is missing");
        assert_eq!(
            err.to_string(),
            "Corrupt index artifact at /tmp/index: chunks.json is missing"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RagError = io.into();
        assert!(matches!(err, RagError::Io(_)));
    }
}
