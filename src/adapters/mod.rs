//! Provider adapter contract — the typed interface every upstream LLM
//! backend implements. One adapter instance owns one pooled HTTP client
//! for its whole process lifetime (constructed once, never rebuilt).

pub mod anthropic;
pub mod deepseek;
pub mod google;
pub mod groq;
pub mod openai;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// A single chat message in the unified request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// The domain-level completion request passed to every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    pub request_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Token usage reported by (or estimated for) a completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// 4 chars ≈ 1 token — the agreed floor when a provider doesn't report usage.
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        Self {
            prompt_tokens: (prompt_chars as u64 / 4).max(1),
            completion_tokens: (completion_chars as u64 / 4).max(1),
        }
    }
}

/// Normalized unary completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    pub raw: Value,
}

/// One incremental streaming chunk. A chunk with `finish_reason.is_some()`
/// terminates the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub provider: String,
    pub model: String,
    pub delta: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// Error raised by a provider adapter, carrying retry/fallback hints.
///
/// `retryable` ⇒ same-model retry with exponential backoff is appropriate.
/// `fallback` ⇒ the router should try the next candidate in the chain
/// (after retries are exhausted, or immediately if `retryable=false`).
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub retryable: bool,
    pub fallback: bool,
    pub message: String,
    pub status_code: Option<u16>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}: {} (retryable={}, fallback={}, status={:?})",
            self.provider, self.model, self.message, self.retryable, self.fallback, self.status_code
        )
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn transient(provider: &str, model: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            retryable: true,
            fallback: false,
            message: message.into(),
            status_code: Some(status),
        }
    }

    pub fn client(provider: &str, model: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            retryable: false,
            fallback: true,
            message: message.into(),
            status_code: Some(status),
        }
    }

    pub fn transport(provider: &str, model: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            retryable: true,
            fallback: false,
            message: message.into(),
            status_code: None,
        }
    }

    /// Exhausted the retry budget for a transient error — router should now fall back.
    pub fn retries_exhausted(mut self) -> Self {
        self.fallback = true;
        self
    }
}

/// A finite, single-consumer receiver of stream chunks. The producer task
/// closes the channel on completion or error; there is no restart.
pub type ChunkStream = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// The universal provider adapter trait. Every upstream LLM backend
/// implements this; the router only ever talks to `dyn ProviderAdapter`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique provider identifier (e.g. "openai", "anthropic", "google").
    fn provider_id(&self) -> &str;

    /// Execute a non-streaming completion request.
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError>;

    /// Execute a streaming completion request. Returns immediately with a
    /// channel; the background task feeds chunks as they arrive.
    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError>;

    /// Estimate USD cost for a request using configured per-1k rates.
    fn estimate_cost(&self, model: &str, usage: &Usage) -> f64;
}

/// Connect/read timeouts shared by all adapters' HTTP clients.
pub struct AdapterTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(30),
        }
    }
}

pub(crate) fn build_http_client(timeouts: &AdapterTimeouts) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.read)
        .build()
        .expect("adapter HTTP client configuration is valid")
}
