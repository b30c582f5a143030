//! # resilience-kit
//!
//! A library of reusable middleware primitives for hardening network-facing
//! AI request handlers against load, abuse, and partial failure.
//!
//! This crate is a **toolkit**, not a running service: each module is a
//! self-contained, independently testable concurrent primitive that a host
//! application wires as a decorator/middleware around its own request
//! pipeline. The HTTP framework, LLM client SDKs, the persistence daemon
//! behind the distributed store, SMTP/Slack/PagerDuty endpoints, and logging
//! infrastructure are all external collaborators consumed through small
//! trait seams, not owned by this crate.
//!
//! ## Modules
//!
//! | Module | Provides |
//! |---|---|
//! | [`rate_limiter`] | Sliding-window and token-bucket rate limiting, memory or remote-backed |
//! | [`circuit_breaker`] | Closed/open/half-open circuit breaker with a registry |
//! | [`retry`] | Backoff-strategy retry executor with jitter and timeouts |
//! | [`context`] | Token-budgeted, append-only conversation truncation |
//! | [`compressor`] | Summarization backend for the context manager's summarize strategy |
//! | [`degradation`] | Primary + ordered-fallback execution with health gating |
//! | [`cache`] | TTL cache backends (in-memory LRU, remote key-prefixed) |
//! | [`session`] | TTL session store layered on a cache backend |
//! | [`slo`] | Rolling-window SLO tracking, error budget, and burn rate |
//! | [`cost`] | Per-model token pricing and periodic budget alerts |
//! | [`alert`] | Multi-channel alert fan-out with dedup and rate limiting |
//! | [`security`] | Input validation and prompt-injection detection |
//! | [`auth`] | Authentication provider contracts (JWT, API key, IAP, OAuth2) |
//! | [`health`] | Liveness/readiness/startup health aggregation |
//! | [`clock`] | Pluggable time source shared by every rolling-window primitive |
//!
//! ## Example: rate limiting a handler
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use resilience_kit::clock::system_clock;
//! use resilience_kit::rate_limiter::{InMemoryBackend, RateLimitAlgorithm, RateLimitConfig, RateLimiter};
//!
//! # async fn run() -> resilience_kit::Result<()> {
//! let config = RateLimitConfig::sliding_window(3, 10.0);
//! let limiter = RateLimiter::new(config, Arc::new(InMemoryBackend::new()), system_clock());
//!
//! let response = limiter.check("user:42").await?;
//! if !response.allowed {
//!     // return 429 with Retry-After: response.retry_after_secs
//! }
//! # Ok(())
//! # }
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Authentication provider contracts: JWT bearer, API key, Google IAP JWT,
/// and OAuth2 token introspection, consumed as external collaborators.
pub mod auth;

/// Pluggable time source shared by every rolling-window primitive.
pub mod clock;

/// Error types and the crate-wide `Result` alias.
pub mod error;

/// Opt-in environment-variable convenience constructors for host wiring.
pub mod env;

/// Liveness, readiness, and startup health aggregation over named components.
pub mod health;

/// L1 primitive: sliding-window and token-bucket rate limiting.
pub mod rate_limiter;

/// L1 primitive: three-state circuit breaker with rolling-window accounting.
pub mod circuit_breaker;

/// L1 primitive: backoff-strategy retry executor with jitter and timeouts.
pub mod retry;

/// L1 primitive: TTL cache backends (in-memory LRU, remote key-prefixed).
pub mod cache;

/// L1 primitive (layered on `cache`): TTL session store.
pub mod session;

/// L1 primitive: rolling-window SLO tracking and error-budget accounting.
pub mod slo;

/// L1 primitive: per-model token pricing and periodic budget alerts.
pub mod cost;

/// L1 detector: input validation and prompt-injection detection.
pub mod security;

/// L2 orchestrator: append-only, token-budgeted conversation truncation.
pub mod context;

/// Summarizer backend consumed by `context`'s summarize truncation strategy.
pub mod compressor;

/// L2 orchestrator: primary + ordered-fallback execution with health gating.
pub mod degradation;

/// L2 orchestrator: multi-channel alert fan-out with dedup and rate limiting.
pub mod alert;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Error Handling ---

pub use error::{Error, Result};

// --- Clock ---

pub use clock::{Clock, FixedClock, SharedClock, SystemClock, system_clock};

// --- Rate Limiter ---

pub use rate_limiter::{
    EndpointRateLimiter, InMemoryBackend as RateLimiterMemoryBackend, MultiTierRateLimiter, RateLimitAlgorithm,
    RateLimitBackend, RateLimitConfig, RateLimitResponse, RateLimitResult, RateLimiter, RedisBackend as RateLimiterRedisBackend,
};

// --- Circuit Breaker ---

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitMetrics, CircuitPresets, CircuitState,
};

// --- Retry ---

pub use retry::{BackoffStrategy, RetryConfig, RetryExecutor, RetryOutcome, RetryPresets, RetryResult};

// --- Context Window Manager ---

pub use context::{
    ApproximateTokenCounter, CallbackTokenCounter, ContextConfig, ContextStats, ContextWindowManager, Message,
    MessageRole, TokenCounter, TruncationStrategy,
};

// --- Summarizer ---

pub use compressor::{CompressionLevel, CompressionResult, CompressorConfig, IncrementalCompressor, MemoryCompressor, SummarizerLlm};

// --- Graceful Degradation ---

pub use degradation::{DegradationManager, FallbackProvider, FallbackReason, FallbackResult};

// --- TTL Cache & Session Store ---

pub use cache::{Cache, CacheBackend, CacheStats, InMemoryBackend, RedisBackend};
pub use session::{Session, SessionMessage, SessionStore};

// --- SLO Tracker ---

pub use slo::{ComplianceStatus, Slo, SloManager, SloStatus, SloTracker, SliType};

// --- Cost Tracker ---

pub use cost::{BudgetConfig, CostTracker, ModelPricing, TokenType, UsageRecord, UsageSummary};

// --- Alert Manager & Channels ---

pub use alert::{
    Alert, AlertChannel, AlertManager, AlertResult, AlertRoute, AlertSeverity, AlertStatus, EmailChannel, MetricsChannel,
    PagerDutyChannel, SlackChannel, WebhookChannel,
};

// --- Input Validator & Injection Detector ---

pub use security::{
    AttackType, DetectionResult, DetectionSensitivity, DetectorConfig, InputValidator, PromptInjectionDetector,
    ThreatType, ValidationConfig, ValidationLevel, ValidationResult,
};

// --- Auth ---

pub use auth::{ApiKeyProvider, AuthMiddleware, AuthProvider, AuthResult, AuthUser, GoogleIapProvider, JwtProvider, OAuth2Provider};

// --- Health ---

pub use health::{ComponentHealth, HealthCheckComponent, HealthChecker, HealthStatus};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module bundling the most commonly used types across every
/// primitive. Import with `use resilience_kit::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Alert, AlertManager, AlertSeverity, ApproximateTokenCounter, Cache, CacheBackend, CircuitBreaker,
        CircuitBreakerRegistry, CircuitConfig, CircuitState, ContextConfig, ContextWindowManager, CostTracker, Error,
        FixedClock, Message, MessageRole, RateLimitConfig, RateLimiter, Result, RetryConfig, RetryExecutor,
        RetryOutcome, Session, SessionStore, Slo, SloManager, SloTracker, SystemClock, TruncationStrategy,
    };
    pub use crate::degradation::DegradationManager;
    pub use crate::security::{InputValidator, PromptInjectionDetector};
}
