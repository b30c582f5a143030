//! Error types for the resilience toolkit.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Central error type for every primitive in the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error (alert channels, OAuth2 introspection).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote shared-store (Redis) error.
    #[error("remote store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A circuit breaker rejected the call before execution.
    #[error("circuit '{name}' is open")]
    CircuitOpen {
        /// Name of the tripped circuit.
        name: String,
    },

    /// Input failed validation.
    #[error("input validation failed: {0}")]
    ValidationFailed(String),

    /// Input was rejected by the prompt-injection policy.
    #[error("prompt injection detected (confidence {confidence:.2}): {explanation}")]
    InjectionDetected {
        /// Combined detector confidence in [0, 1].
        confidence: f64,
        /// Human-readable explanation.
        explanation: String,
    },

    /// A rate limit was exceeded.
    #[error("rate limit exceeded for key '{key}', retry after {retry_after_secs:.2}s")]
    RateLimited {
        /// The rate-limit key that was denied.
        key: String,
        /// Seconds until the next request may be allowed.
        retry_after_secs: f64,
    },

    /// A retry executor ran out of attempts.
    #[error("retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        #[source]
        source: Box<Error>,
    },

    /// A retry executor observed a non-retryable error and aborted.
    #[error("retry aborted on non-retryable error: {source}")]
    RetryAborted {
        /// The non-retryable error observed.
        #[source]
        source: Box<Error>,
    },

    /// An operation exceeded its configured timeout.
    #[error("operation timed out")]
    TimedOut,

    /// A graceful-degradation chain exhausted its primary and all fallbacks.
    #[error("all fallbacks exhausted, original cause: {source}")]
    FallbacksExhausted {
        /// The error that triggered the fallback chain.
        #[source]
        source: Box<Error>,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// API error from an external collaborator (LLM call, introspection endpoint, etc.).
    #[error("API error: {0}")]
    Api(String),

    /// Invalid input that is a programming/usage error rather than a security concern.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Catch-all for conditions not covered by a dedicated variant.
    #[error("error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a circuit-open error.
    pub fn circuit_open(name: impl Into<String>) -> Self {
        Error::CircuitOpen { name: name.into() }
    }

    /// Create a validation-failed error.
    pub fn validation_failed(msg: impl Into<String>) -> Self {
        Error::ValidationFailed(msg.into())
    }

    /// Create an injection-detected error.
    pub fn injection_detected(confidence: f64, explanation: impl Into<String>) -> Self {
        Error::InjectionDetected {
            confidence,
            explanation: explanation.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(key: impl Into<String>, retry_after_secs: f64) -> Self {
        Error::RateLimited {
            key: key.into(),
            retry_after_secs,
        }
    }

    /// Create a retry-exhausted error wrapping the last observed cause.
    pub fn retry_exhausted(attempts: u32, source: Error) -> Self {
        Error::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Create a retry-aborted error wrapping the non-retryable cause.
    pub fn retry_aborted(source: Error) -> Self {
        Error::RetryAborted {
            source: Box::new(source),
        }
    }

    /// Create a timeout error.
    pub fn timed_out() -> Self {
        Error::TimedOut
    }

    /// Create a fallbacks-exhausted error wrapping the original cause.
    pub fn fallbacks_exhausted(source: Error) -> Self {
        Error::FallbacksExhausted {
            source: Box::new(source),
        }
    }

    /// Create an auth-failed error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Error::AuthFailed(msg.into())
    }

    /// Create a new API error.
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new invalid-input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True if this error represents a rejection that happened before any
    /// real work was attempted (circuit open, rate limited, validation).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::RateLimited { .. }
                | Error::ValidationFailed(_)
                | Error::InjectionDetected { .. }
        )
    }
}
