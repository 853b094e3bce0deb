//! Backend capability contract and provider adapters
//!
//! The router depends only on the [`Backend`] trait. One implementation is
//! registered per provider in a [`ProviderRegistry`]; the catalog maps each
//! backend name to its provider.
//!
//! Adapters shipped here:
//! - [`EchoBackend`]: deterministic echo for demos and tests
//! - [`OpenAiCompatibleBackend`]: any `/v1/chat/completions` endpoint
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: default key for [`OpenAiCompatibleBackend::from_env`]
//! - `OPENAI_BASE_URL`: default base URL (default: `https://api.openai.com`)

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::request::TaskKind;
use crate::RouterError;

/// Failure reported by a provider adapter for one call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Transport-level failure (connect, TLS, reset).
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider answered with a non-success status.
    #[error("provider returned status {status}: {body}")]
    Status {
        /// HTTP (or HTTP-like) status code.
        status: u16,
        /// Response body, truncated by the adapter.
        body: String,
    },
    /// The provider answered but the payload was unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The provider does not serve the requested backend.
    #[error("backend '{0}' is not served by this provider")]
    UnknownBackend(String),
}

impl BackendError {
    /// Whether retrying the same backend can help.
    ///
    /// Client errors (4xx other than 408 and 429) and unknown backends are
    /// final for that backend; the executor moves on to the next one.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !(400..500).contains(status) || *status == 408 || *status == 429,
            Self::UnknownBackend(_) => false,
            Self::Transport(_) | Self::InvalidResponse(_) => true,
        }
    }
}

/// Payload handed to a provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    /// Catalog name of the backend (the model id for the provider).
    pub backend: String,
    /// Correlation id of the routed request.
    pub request_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Task kind, for adapters that tune system prompts per task.
    pub task: TaskKind,
    /// Upper bound on generated tokens.
    pub max_output_tokens: u64,
}

/// Token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Sum of input and output tokens.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Successful provider reply.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    /// Generated content.
    pub content: String,
    /// Token usage as reported (or estimated) by the adapter.
    pub usage: TokenUsage,
    /// Latency of the call as measured by the adapter.
    pub latency: Duration,
    /// Adapter-supplied quality in `[0.0, 1.0]`, if it has one.
    pub quality: Option<f64>,
}

/// Uniform capability contract implemented once per provider.
///
/// Implementations must be `Send + Sync`; the trait is object-safe so the
/// router holds adapters as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute `request` against the named backend.
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;

    /// Cheap liveness probe for the named backend.
    async fn is_healthy(&self, _backend: &str) -> bool {
        true
    }
}

/// Provider name → adapter map.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Arc<DashMap<String, Arc<dyn Backend>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ProviderRegistry").field("providers", &names).finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for `provider`.
    pub fn register(&self, provider: impl Into<String>, backend: Arc<dyn Backend>) {
        self.providers.insert(provider.into(), backend);
    }

    /// Adapter for `provider`, if registered.
    pub fn get(&self, provider: &str) -> Option<Arc<dyn Backend>> {
        self.providers.get(provider).map(|e| Arc::clone(e.value()))
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Return `true` if no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Rough token estimate used by adapters that get no usage report.
pub fn estimate_tokens(text: &str) -> u64 {
    // ~4 characters per token, never zero for non-empty text
    let chars = text.chars().count() as u64;
    if chars == 0 {
        0
    } else {
        chars.div_ceil(4)
    }
}

// ============================================================================
// Echo Backend
// ============================================================================

/// Echo adapter for demos and tests.
///
/// Replies with the prompt prefixed by the backend name after a fixed delay.
pub struct EchoBackend {
    /// Simulated call latency.
    pub delay: Duration,
}

impl EchoBackend {
    /// Echo adapter with a 10ms delay.
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }

    /// Echo adapter with a custom delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for EchoBackend {
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;

        let content = format!("[{}] {}", request.backend, request.prompt);
        let usage = TokenUsage {
            input_tokens: estimate_tokens(&request.prompt),
            output_tokens: estimate_tokens(&content),
        };

        Ok(BackendResponse {
            content,
            usage,
            latency: started.elapsed(),
            quality: None,
        })
    }
}

// ============================================================================
// OpenAI-compatible Backend
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Adapter for any OpenAI-compatible chat completions endpoint
/// (OpenAI, vLLM, llama.cpp server, OpenRouter, ...).
///
/// The catalog backend name is sent as the `model` field.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_backend_router::{OpenAiCompatibleBackend, ProviderRegistry};
///
/// let providers = ProviderRegistry::new();
/// let openai = OpenAiCompatibleBackend::from_env().expect("OPENAI_API_KEY");
/// providers.register("openai", Arc::new(openai));
/// ```
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleBackend {
    /// Create an adapter for `base_url`, with an optional bearer key.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConfigError`] if `OPENAI_API_KEY` is not set, so
    /// misconfiguration surfaces at startup rather than at the first call.
    pub fn from_env() -> Result<Self, RouterError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RouterError::ConfigError("OPENAI_API_KEY not set".to_string()))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".to_string());
        Ok(Self::new(base_url, Some(api_key)))
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

/// Longest provider error body kept in [`BackendError::Status`], in bytes.
const MAX_ERROR_BODY: usize = 512;

/// Cut `body` to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_on_char_boundary(mut body: String, max: usize) -> String {
    if body.len() > max {
        let cut = (0..=max).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl Backend for OpenAiCompatibleBackend {
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let started = Instant::now();
        let body = ChatRequest {
            model: &request.backend,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_output_tokens,
        };

        let mut builder = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = truncate_on_char_boundary(response.text().await.unwrap_or_default(), MAX_ERROR_BODY);
            return Err(BackendError::Status { status, body });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::InvalidResponse("no choices in response".to_string()))?;

        let usage = match parsed.usage {
            Some(u) => TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            },
            None => TokenUsage {
                input_tokens: estimate_tokens(&request.prompt),
                output_tokens: estimate_tokens(&content),
            },
        };

        Ok(BackendResponse {
            content,
            usage,
            latency: started.elapsed(),
            quality: None,
        })
    }

    async fn is_healthy(&self, _backend: &str) -> bool {
        let mut builder = self.client.get(format!("{}/v1/models", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        matches!(builder.send().await, Ok(r) if r.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> BackendRequest {
        BackendRequest {
            backend: "echo-small".to_string(),
            request_id: "req-1".to_string(),
            prompt: prompt.to_string(),
            task: TaskKind::Chat,
            max_output_tokens: 256,
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::Transport("reset".into()).is_retryable());
        assert!(BackendError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(BackendError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!BackendError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!BackendError::UnknownBackend("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_echo_backend_prefixes_backend_name() {
        let backend = EchoBackend::with_delay(Duration::ZERO);
        let resp = backend.execute(&request("hello world")).await.unwrap();
        assert_eq!(resp.content, "[echo-small] hello world");
        assert!(resp.usage.input_tokens > 0);
        assert!(resp.quality.is_none());
    }

    #[tokio::test]
    async fn test_echo_backend_default_is_healthy() {
        assert!(EchoBackend::new().is_healthy("anything").await);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[test]
    fn test_token_usage_total() {
        let u = TokenUsage {
            input_tokens: 3,
            output_tokens: 4,
        };
        assert_eq!(u.total(), 7);
    }

    #[test]
    fn test_provider_registry_register_and_get() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register("echo", Arc::new(EchoBackend::new()));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.len(), 1);
        assert!(format!("{registry:?}").contains("echo"));
    }

    #[test]
    fn test_openai_compatible_trims_trailing_slash() {
        let backend = OpenAiCompatibleBackend::new("http://localhost:8000/", None);
        assert_eq!(backend.completions_url(), "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn test_truncate_keeps_short_bodies() {
        assert_eq!(truncate_on_char_boundary("short".to_string(), 512), "short");
    }

    #[test]
    fn test_truncate_backs_off_to_char_boundary() {
        // 'é' is two bytes and straddles the cut at 512.
        let body = format!("{}é{}", "a".repeat(511), "b".repeat(100));
        let cut = truncate_on_char_boundary(body, 512);
        assert_eq!(cut.len(), 511);
        assert!(cut.chars().all(|c| c == 'a'));

        let emoji = "🦀".repeat(200);
        let cut = truncate_on_char_boundary(emoji, 513);
        assert_eq!(cut.len(), 512);
        assert_eq!(cut.chars().count(), 128);
    }

    #[tokio::test]
    async fn test_openai_compatible_multibyte_error_body_is_truncated() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = format!("{}é{}", "a".repeat(511), "ü".repeat(300));
        let server_body = body.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; 8192];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 500 Internal Server Error\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                server_body.len(),
                server_body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let backend = OpenAiCompatibleBackend::new(format!("http://{addr}"), None);
        match backend.execute(&request("hi")).await.unwrap_err() {
            BackendError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "a".repeat(511));
            }
            other => std::panic::panic_any(format!("expected status error, got {other:?}")),
        }
    }

    #[tokio::test]
    async fn test_openai_compatible_unreachable_is_transport_error() {
        // Port 9 (discard) on localhost is not an HTTP server.
        let backend = OpenAiCompatibleBackend::new("http://127.0.0.1:9", None);
        let err = backend.execute(&request("hi")).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)), "got {err:?}");
        assert!(!backend.is_healthy("m").await);
    }
}
