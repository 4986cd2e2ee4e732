//! Error types for crag-core.

use thiserror::Error;

/// Result type alias using crag-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during query orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: empty message list, unknown model, contract mismatch.
    /// Surfaced immediately, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A single backend attempt failed transiently (network error, 5xx,
    /// attempt timeout). Retried via the cascade.
    #[error("Backend {backend} unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    /// Backend rate limit hit. Retried via the cascade after backoff.
    #[error("Rate limited by {backend}")]
    RateLimited {
        backend: String,
        /// Backoff recommendation from the backend, if it sent one.
        retry_after_ms: Option<u64>,
    },

    /// Backend quota is gone for good. Disables that backend for the rest
    /// of the request; the cascade proceeds to the next candidate.
    #[error("Quota exhausted on {backend}")]
    QuotaExhausted { backend: String },

    /// Cooperative cancellation. Surfaced as-is.
    #[error("Request cancelled")]
    Cancelled,

    /// The per-request deadline elapsed. Surfaced as-is.
    #[error("Deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// Every candidate in the cascade failed with a retryable error.
    #[error("Synthesis failed after {attempts} attempts: {last_error}")]
    SynthesisFailed { attempts: u32, last_error: String },

    /// Retrieval backend error.
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a backend-unavailable error.
    pub fn backend_unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(backend: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            backend: backend.into(),
            retry_after_ms,
        }
    }

    /// Create a quota-exhausted error.
    pub fn quota_exhausted(backend: impl Into<String>) -> Self {
        Self::QuotaExhausted {
            backend: backend.into(),
        }
    }

    /// Whether the cascade may try another candidate after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::RateLimited { .. }
        )
    }

    /// Whether the error terminates the whole request regardless of
    /// remaining fallback candidates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::Cancelled | Self::DeadlineExceeded { .. }
        )
    }
}
