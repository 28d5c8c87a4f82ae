//! Error types for the AI orchestration layer.
//!
//! All fallible operations in this crate return [`Result<T>`]. The error
//! taxonomy separates the failures the retry executor may act on (provider
//! responses with an HTTP-like status, transport failures) from the ones
//! that are terminal for the request (configuration, validation, missing
//! prompt data).
//!
//! # Example
//! ```
//! use trendscope_ai::error::AiError;
//!
//! let err = AiError::provider(429, "openai", "rate limited upstream");
//! assert_eq!(err.status(), Some(429));
//! assert_eq!(err.http_status(), 503);
//! ```

use std::time::Duration;

use thiserror::Error;

/// Result type for all operations in this crate.
pub type Result<T> = std::result::Result<T, AiError>;

/// Errors that can occur while orchestrating a generation request.
#[derive(Error, Debug)]
pub enum AiError {
    /// A backend answered with a non-success status. Carries enough for the
    /// retry executor to classify the failure without inspecting
    /// backend-specific error shapes.
    #[error("provider {provider} returned status {status}: {message}")]
    Provider {
        /// HTTP-like status code reported by the backend.
        status: u16,
        /// Provider name (`openai`, `anthropic`, `gemini`, ...).
        provider: String,
        /// Backend-supplied message, for logs only.
        message: String,
        /// Parsed `Retry-After` hint, when the backend sent one.
        retry_after: Option<Duration>,
    },

    /// Transport-level failure before any status was received.
    #[error("network error: {0}")]
    Network(String),

    /// The request or a response exceeded a deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid or missing configuration (unknown provider tag, absent
    /// credential). Fatal for the request that triggered it.
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A prompt key or version does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Structured output could not be parsed as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backing store failed. The rate limiter converts this to fail-open
    /// and telemetry swallows it; other paths propagate.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AiError {
    /// Build a provider error without a `Retry-After` hint.
    pub fn provider(
        status: u16,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AiError::Provider {
            status,
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attach a `Retry-After` hint to a provider error. No-op for other
    /// variants.
    pub fn with_retry_after(mut self, hint: Duration) -> Self {
        if let AiError::Provider { retry_after, .. } = &mut self {
            *retry_after = Some(hint);
        }
        self
    }

    /// The HTTP-like status attached to a provider failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AiError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The `Retry-After` hint attached to a provider failure, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AiError::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Transport failures carry no status; the retry executor treats them
    /// as transient.
    pub fn is_transport(&self) -> bool {
        matches!(self, AiError::Network(_) | AiError::Timeout(_))
    }

    /// Status code this error maps to at the HTTP boundary.
    ///
    /// Provider and transport failures surface as 503 once retries are
    /// exhausted; validation as 400; missing prompt data as 404; everything
    /// internal as 500. Rate-limit denials never reach this path (they are
    /// data, not errors).
    pub fn http_status(&self) -> u16 {
        match self {
            AiError::Provider { .. } | AiError::Network(_) | AiError::Timeout(_) => 503,
            AiError::InvalidInput(_) => 400,
            AiError::NotFound(_) => 404,
            AiError::Config(_) | AiError::Serialization(_) | AiError::Storage(_) => 500,
        }
    }

    /// Caller-safe message for the HTTP boundary. Never leaks provider
    /// internals or backend error text.
    pub fn user_message(&self) -> &'static str {
        match self {
            AiError::Provider { .. } | AiError::Network(_) | AiError::Timeout(_) => {
                "AI generation is temporarily unavailable. Please try again shortly."
            }
            AiError::InvalidInput(_) => "The request was invalid.",
            AiError::NotFound(_) => "The requested resource was not found.",
            AiError::Config(_) | AiError::Serialization(_) | AiError::Storage(_) => {
                "An internal error occurred."
            }
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AiError::Timeout(err.to_string())
        } else if err.is_connect() {
            AiError::Network(format!("connection failed: {}", err))
        } else {
            AiError::Network(err.to_string())
        }
    }
}
