//! Configuration for the retrieval, generation and verification pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.

use crate::error::{RagError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

/// Token-window chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Window size in tokens.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Tokens shared by consecutive windows. Must be smaller than `chunk_size`.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// BPE encoding used to count tokens ("cl100k_base", "o200k_base", "p50k_base", "r50k_base").
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}

fn default_overlap() -> usize {
    50
}

fn default_tokenizer() -> String {
    "cl100k_base".to_string()
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default), "openai", "ollama".
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Provider-specific model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Vector dimensionality for the local embedder.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    /// Texts per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Override for the provider endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key for remote providers.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            base_url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_batch_size() -> usize {
    32
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Retrieval and reranking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates fetched from the vector index per question.
    #[serde(default = "default_k_retrieve")]
    pub k_retrieve: usize,
    /// Candidates kept after reranking.
    #[serde(default = "default_k_rerank")]
    pub k_rerank: usize,
    #[serde(default = "default_true")]
    pub use_reranker: bool,
    /// Relevance scorer: "lexical" (default, offline) or "cross-encoder".
    #[serde(default = "default_reranker")]
    pub reranker: String,
    /// Endpoint of a text-embeddings-inference style `/rerank` server.
    #[serde(default)]
    pub reranker_url: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_retrieve: default_k_retrieve(),
            k_rerank: default_k_rerank(),
            use_reranker: true,
            reranker: default_reranker(),
            reranker_url: None,
        }
    }
}

fn default_k_retrieve() -> usize {
    10
}

fn default_k_rerank() -> usize {
    5
}

fn default_reranker() -> String {
    "lexical".to_string()
}

/// Answer generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Generator variant: "remote" (OpenAI-compatible chat), "local" (llama.cpp CLI), "none".
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Chat completions base URL, e.g. `http://localhost:11434/v1` for Ollama.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request timeout for remote generation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after a transient remote failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Character budget for the joined context passed to the model.
    #[serde(default)]
    pub context_budget_chars: Option<usize>,
    /// llama.cpp CLI binary used by the local generator.
    #[serde(default = "default_local_binary")]
    pub local_binary: String,
    /// GGUF model file used by the local generator.
    #[serde(default)]
    pub local_model_path: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            context_budget_chars: None,
            local_binary: default_local_binary(),
            local_model_path: None,
        }
    }
}

fn default_generation_provider() -> String {
    "remote".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> usize {
    1024
}

fn default_temperature() -> f32 {
    0.3
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    1
}

fn default_local_binary() -> String {
    "llama-cli".to_string()
}

/// Grounding verification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// A sentence is supported when its best chunk similarity exceeds this.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Minimum fraction of supported sentences for an answer to be shown.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.1
}

fn default_confidence_threshold() -> f32 {
    0.7
}

/// Where the index artifact lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from(".groundrag/index")
}

fn default_true() -> bool {
    true
}

impl RagConfig {
    /// Reject settings the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(RagError::config("chunking.chunk_size must be positive"));
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            return Err(RagError::config(format!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::config("embedding.batch_size must be positive"));
        }
        if self.retrieval.k_retrieve == 0 || self.retrieval.k_rerank == 0 {
            return Err(RagError::config(
                "retrieval.k_retrieve and retrieval.k_rerank must be positive",
            ));
        }
        for (name, value) in [
            (
                "verification.similarity_threshold",
                self.verification.similarity_threshold,
            ),
            (
                "verification.confidence_threshold",
                self.verification.confidence_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RagError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Path of the user-level config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "groundrag", "groundrag")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `GROUNDRAG_`, `__` between sections)
/// 3. Workspace config (`groundrag.toml`) or the explicit `config_file`
/// 4. User config (`~/.config/groundrag/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&RagConfig>,
) -> std::result::Result<RagConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RagConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join("groundrag.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        figment = figment.merge(Toml::file(file));
    }

    // GROUNDRAG_VERIFICATION__CONFIDENCE_THRESHOLD, GROUNDRAG_GENERATION__MODEL, ...
    figment = figment.merge(Env::prefixed("GROUNDRAG_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = RagConfig::default();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.retrieval.k_retrieve, 10);
        assert_eq!(config.retrieval.k_rerank, 5);
        assert!(config.retrieval.use_reranker);
        assert_eq!(config.generation.max_tokens, 1024);
        assert!((config.verification.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_empty_sections() {
        let config: RagConfig = serde_json::from_str(r#"{"chunking": {}}"#).unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.index.dir, PathBuf::from(".groundrag/index"));
    }

    #[test]
    fn test_validate_rejects_overlap_not_below_chunk_size() {
        let mut config = RagConfig::default();
        config.chunking.overlap = config.chunking.chunk_size;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = RagConfig::default();
        config.verification.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_reads_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("groundrag.toml"),
            "[retrieval]\nk_retrieve = 25\nuse_reranker = false\n",
        )
        .unwrap();
        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.retrieval.k_retrieve, 25);
        assert!(!config.retrieval.use_reranker);
        assert_eq!(config.retrieval.k_rerank, 5);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("groundrag.toml"),
            "[chunking]\nchunk_size = 128\n",
        )
        .unwrap();
        let mut overrides = RagConfig::default();
        overrides.chunking.chunk_size = 64;
        overrides.chunking.overlap = 8;
        let config = load_config(Some(dir.path()), None, Some(&overrides)).unwrap();
        assert_eq!(config.chunking.chunk_size, 64);
        assert_eq!(config.chunking.overlap, 8);
    }
}
