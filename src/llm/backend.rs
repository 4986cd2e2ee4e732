//! Backend adapter contract and shared HTTP plumbing.
//!
//! The three generative backends are modeled as a closed tagged variant;
//! each variant owns its connection handle and wire codec. The
//! [`BackendClient`] trait is the seam test doubles implement.

use async_trait::async_trait;
use futures::Stream;
use reqwest::{Client, StatusCode};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::llm::anthropic::AnthropicBackend;
use crate::llm::gemini::GeminiBackend;
use crate::llm::openai::OpenAiBackend;
use crate::llm::types::{BackendId, CompletionRequest, FinishReason, ModelConfig, TokenUsage};

/// End-to-end HTTP timeout applied when the config does not set one.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration shared by all backend adapters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key presented to the backend
    pub api_key: String,
    /// Override for the backend's default endpoint
    pub base_url: Option<String>,
    /// End-to-end HTTP timeout
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Shared HTTP handle for a backend adapter.
///
/// reqwest's default builder probes system proxy settings, and that probe
/// can panic inside sandboxed environments. Try the normal build once;
/// if it blows up (or errors), retry with proxy detection disabled.
pub(crate) fn build_http_client(timeout: Duration) -> Client {
    let probed = catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    }));
    if let Ok(Ok(client)) = probed {
        return client;
    }

    Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
        .expect("HTTP client construction failed even with proxy detection disabled")
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn classify_status(
    backend: BackendId,
    status: StatusCode,
    body: &str,
    retry_after_ms: Option<u64>,
) -> Error {
    match status.as_u16() {
        429 => Error::rate_limited(backend.to_string(), retry_after_ms),
        402 => Error::quota_exhausted(backend.to_string()),
        403 if body.to_lowercase().contains("quota") || body.to_lowercase().contains("billing") => {
            Error::quota_exhausted(backend.to_string())
        }
        400 | 404 | 422 => Error::invalid_request(format!("{backend} rejected request: {body}")),
        _ if status.is_server_error() => {
            Error::backend_unavailable(backend.to_string(), format!("{status}: {body}"))
        }
        _ => Error::backend_unavailable(backend.to_string(), format!("{status}: {body}")),
    }
}

/// Map a transport-level failure to the error taxonomy.
pub(crate) fn classify_transport(backend: BackendId, err: reqwest::Error) -> Error {
    Error::backend_unavailable(backend.to_string(), err.to_string())
}

/// Parse a `Retry-After` header value into milliseconds.
pub(crate) fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs * 1000)
}

/// Adapter-level completion, before cost and cache accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCompletion {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// Adapter-level stream element.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStreamEvent {
    /// A text delta in generation order.
    Delta(String),
    /// Terminal event with the backend's usage accounting.
    Finish {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },
}

/// Boxed stream of adapter events.
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawStreamEvent>> + Send>>;

/// Common completion contract over the backend wire formats.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn backend_id(&self) -> BackendId;

    /// Blocking call for a full completion.
    async fn complete(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawCompletion>;

    /// Lazy finite chunk sequence terminated by a `Finish` event.
    /// Concatenating all deltas equals the completed content.
    async fn stream(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawEventStream>;
}

/// The three backends as a closed tagged variant. Each carries its own
/// connection handle; dispatch is a match, not dynamic reflection.
pub enum Backend {
    Anthropic(AnthropicBackend),
    OpenAi(OpenAiBackend),
    Gemini(GeminiBackend),
}

impl Backend {
    pub fn id(&self) -> BackendId {
        match self {
            Self::Anthropic(_) => BackendId::Anthropic,
            Self::OpenAi(_) => BackendId::OpenAi,
            Self::Gemini(_) => BackendId::Gemini,
        }
    }

    pub async fn complete(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawCompletion> {
        match self {
            Self::Anthropic(b) => b.complete(model, request).await,
            Self::OpenAi(b) => b.complete(model, request).await,
            Self::Gemini(b) => b.complete(model, request).await,
        }
    }

    pub async fn stream(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawEventStream> {
        match self {
            Self::Anthropic(b) => b.stream(model, request).await,
            Self::OpenAi(b) => b.stream(model, request).await,
            Self::Gemini(b) => b.stream(model, request).await,
        }
    }
}
