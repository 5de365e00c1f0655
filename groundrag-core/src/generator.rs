//! Answer generation.
//!
//! A [`Generator`] always hands back a string. Initialization problems and
//! provider failures come back as sentinel error strings so the pipeline can
//! run verification and citation over whatever was produced.

use crate::config::GenerationConfig;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Returned when the model or client never came up.
pub const GENERATOR_NOT_LOADED: &str = "Error: Generator model not loaded.";
/// Returned when the local model ran but failed.
pub const GENERATION_FAILED: &str = "Error generating answer.";
/// Prefix of the string returned when the remote model cannot be reached.
pub const REMOTE_FAILURE_PREFIX: &str = "Error generating answer from remote model";

/// Placed between context chunks.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";
/// Appended when the joined context is cut to the budget.
pub const TRUNCATION_MARKER: &str = "...";
/// Context budget of the local model, in characters.
pub const LOCAL_CONTEXT_BUDGET: usize = 2000;
/// Context budget of the remote model, in characters.
pub const REMOTE_CONTEXT_BUDGET: usize = 24_000;

const CANNOT_ANSWER: &str = "I cannot answer this based on the provided documents.";

/// Produces an answer to `query` from `context` chunks.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, query: &str, context: &[String]) -> String;

    fn name(&self) -> &str;
}

/// Join chunks and keep at most `budget` characters, marking any cut.
pub fn join_context(chunks: &[String], budget: usize) -> String {
    let joined = chunks.join(CONTEXT_SEPARATOR);
    match joined.char_indices().nth(budget) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &joined[..cut]),
        None => joined,
    }
}

/// Instruction prompt restricting the model to `chunks`.
pub fn build_prompt(query: &str, chunks: &[String], budget: usize) -> String {
    let context = join_context(chunks, budget);
    format!(
        "Answer the question using ONLY the provided context. \
         If the answer is not contained in the context, say \"{CANNOT_ANSWER}\"\n\n\
         Context:\n{context}\n\n\
         Question: {query}\n\n\
         Answer:"
    )
}

/// Build the configured generator. `None` selects retrieval-only mode.
pub fn create_generator(config: &GenerationConfig) -> Option<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "remote" => Some(Arc::new(RemoteGenerator::new(config))),
        "local" => Some(Arc::new(LocalGenerator::new(config))),
        "none" => {
            info!("No generator configured, running in retrieval-only mode");
            None
        }
        other => {
            warn!(provider = %other, "Unknown generation provider, running in retrieval-only mode");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Local (llama.cpp CLI)
// ---------------------------------------------------------------------------

/// Offline generator that runs a llama.cpp CLI against a GGUF model file.
#[derive(Debug, Clone)]
pub struct LocalGenerator {
    binary: String,
    model_path: Option<PathBuf>,
    max_tokens: usize,
    temperature: f32,
    budget: usize,
}

impl LocalGenerator {
    pub fn new(config: &GenerationConfig) -> Self {
        let model_path = match &config.local_model_path {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(path) => {
                warn!(path = %path.display(), "Local model file not found, generator disabled");
                None
            }
            None => {
                warn!("No local_model_path configured, generator disabled");
                None
            }
        };
        Self {
            binary: config.local_binary.clone(),
            model_path,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            budget: config.context_budget_chars.unwrap_or(LOCAL_CONTEXT_BUDGET),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model_path.is_some()
    }

    /// Run the binary once. A missing binary is reported as
    /// [`RagError::ModelUnavailable`], a failed run as [`RagError::Generation`].
    async fn run(&self, model_path: &Path, prompt: &str) -> Result<String> {
        let out = tokio::process::Command::new(&self.binary)
            .arg("-m")
            .arg(model_path)
            .arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .arg("--temp")
            .arg(self.temperature.to_string())
            .arg("--no-display-prompt")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RagError::model_unavailable("generator", format!("{} not found", self.binary))
                } else {
                    RagError::generation(format!("could not start {}: {e}", self.binary))
                }
            })?;

        if !out.status.success() {
            return Err(RagError::generation(format!(
                "{} exited with {}: {}",
                self.binary,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait]
impl Generator for LocalGenerator {
    async fn generate(&self, query: &str, context: &[String]) -> String {
        let Some(model_path) = &self.model_path else {
            return GENERATOR_NOT_LOADED.to_string();
        };
        let prompt = build_prompt(query, context, self.budget);

        match self.run(model_path, &prompt).await {
            Ok(text) => {
                debug!(chars = text.len(), "Local generation finished");
                text
            }
            Err(e @ RagError::ModelUnavailable { .. }) => {
                warn!(error = %e, "Local generator binary not found");
                GENERATOR_NOT_LOADED.to_string()
            }
            Err(e) => {
                warn!(error = %e, "Local generation failed");
                GENERATION_FAILED.to_string()
            }
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// Remote (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

/// Generator backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct RemoteGenerator {
    client: Option<reqwest::Client>,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
    max_retries: u32,
    budget: usize,
}

/// One failed attempt, and whether another attempt could succeed.
#[derive(Debug, Clone, PartialEq)]
struct CallFailure {
    message: String,
    retryable: bool,
}

impl RemoteGenerator {
    /// Reads the API key from the configured environment variable. Without a
    /// key and without a custom `base_url` the generator is left unloaded.
    pub fn new(config: &GenerationConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &GenerationConfig, api_key: Option<String>) -> Self {
        let client = if api_key.is_none() && config.base_url.is_none() {
            warn!(env = %config.api_key_env, "Remote generator unavailable (API key not set)");
            None
        } else {
            match reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
            {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "Failed to build HTTP client for remote generator");
                    None
                }
            }
        };
        Self {
            client,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            budget: config.context_budget_chars.unwrap_or(REMOTE_CONTEXT_BUDGET),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.client.is_some()
    }

    async fn complete_once(
        &self,
        client: &reqwest::Client,
        prompt: &str,
    ) -> std::result::Result<String, CallFailure> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let mut request = client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| CallFailure {
            retryable: e.is_timeout() || e.is_connect(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| CallFailure {
            retryable: e.is_timeout(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(map_http_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| CallFailure {
            message: format!("invalid response body: {e}"),
            retryable: false,
        })?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CallFailure {
                message: "response has no message content".into(),
                retryable: false,
            })
    }
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> CallFailure {
    match status.as_u16() {
        401 | 403 => CallFailure {
            message: format!("authentication failed ({status})"),
            retryable: false,
        },
        429 => CallFailure {
            message: "rate limited".into(),
            retryable: true,
        },
        code if code >= 500 => CallFailure {
            message: format!("server error ({status}): {body}"),
            retryable: true,
        },
        _ => CallFailure {
            message: format!("HTTP {status}: {body}"),
            retryable: false,
        },
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((500u64 << attempt.min(4)).min(5_000))
}

#[async_trait]
impl Generator for RemoteGenerator {
    async fn generate(&self, query: &str, context: &[String]) -> String {
        let Some(client) = &self.client else {
            return GENERATOR_NOT_LOADED.to_string();
        };
        let prompt = build_prompt(query, context, self.budget);

        let mut attempt = 0;
        loop {
            match self.complete_once(client, &prompt).await {
                Ok(answer) => {
                    debug!(
                        model = %self.model,
                        attempt,
                        chars = answer.len(),
                        "Remote generation finished"
                    );
                    return answer;
                }
                Err(failure) if failure.retryable && attempt < self.max_retries => {
                    let delay = backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(
                        model = %self.model,
                        error = %failure.message,
                        "Remote generation failed"
                    );
                    return format!("{REMOTE_FAILURE_PREFIX}: {}", failure.message);
                }
            }
        }
    }

    fn name(&self) -> &str {
        "remote"
    }
}
