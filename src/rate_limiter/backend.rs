//! Backend contract for the rate limiter: the atomic primitives a sliding
//! window or token bucket needs, independent of where the counters live.

use async_trait::async_trait;

use crate::error::Result;

/// Which counting algorithm a [`crate::rate_limiter::RateLimiter`] enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    /// Rolling count of request timestamps within the last `window_seconds`.
    SlidingWindow,
    /// Capacity-bounded reservoir refilled continuously at a fixed rate.
    TokenBucket,
}

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The request is within quota.
    Allowed,
    /// The request exceeds quota and must be rejected.
    Denied,
}

/// Configuration for one rate limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Counting algorithm.
    pub algorithm: RateLimitAlgorithm,
    /// Maximum requests allowed per window (sliding window) or the bucket's
    /// refill-defining rate `limit / window_seconds` (token bucket).
    pub limit: u64,
    /// Window length in seconds.
    pub window_seconds: f64,
    /// Token bucket capacity; defaults to `limit` when unset. Ignored for
    /// sliding window.
    pub burst: Option<u64>,
    /// Cost in tokens/slots charged per request. Defaults to 1.
    pub cost: u64,
}

impl RateLimitConfig {
    /// A sliding-window config allowing `limit` requests per `window_seconds`.
    pub fn sliding_window(limit: u64, window_seconds: f64) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            limit,
            window_seconds,
            burst: None,
            cost: 1,
        }
    }

    /// A token-bucket config refilling at `limit / window_seconds` tokens/sec.
    pub fn token_bucket(limit: u64, window_seconds: f64) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limit,
            window_seconds,
            burst: None,
            cost: 1,
        }
    }

    /// Override the token-bucket burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Override the per-request cost.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window_seconds
    }

    fn capacity(&self) -> f64 {
        self.burst.unwrap_or(self.limit) as f64
    }
}

/// Result of a single atomic sliding-window check.
#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowOutcome {
    /// Number of entries remaining in the window after this check's entry
    /// was recorded.
    pub count_after: u64,
    /// When the window resets: the oldest remaining entry's timestamp plus
    /// the window length, or `now + window` if the window was empty.
    pub reset_at: f64,
}

/// Result of a single atomic token-bucket check.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketOutcome {
    /// Whether the requested cost was available and consumed.
    pub allowed: bool,
    /// Tokens remaining after this check (post-consumption if allowed).
    pub tokens_remaining: f64,
    /// Seconds until `cost` tokens will be available, valid when denied.
    pub retry_after: f64,
}

/// The atomic operations a rate-limit backend must provide.
///
/// Implementations MUST make each method linearizable per key: concurrent
/// callers against the same key observe a total order consistent with some
/// sequential execution. Implementations must not hold a lock across an
/// `.await` that performs I/O (the remote backend's script invocation is
/// itself the atomic unit; nothing else should be held around it).
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Atomically evict entries older than `window_seconds`, record a new
    /// entry at `now`, and report the post-insert count and reset time.
    async fn check_sliding_window(
        &self,
        key: &str,
        window_seconds: f64,
        now: f64,
    ) -> Result<SlidingWindowOutcome>;

    /// Atomically refill and attempt to consume `cost` tokens.
    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now: f64,
    ) -> Result<TokenBucketOutcome>;

    /// Clear all counters associated with `key`.
    async fn reset(&self, key: &str) -> Result<()>;
}

pub(crate) fn refill_rate(config: &RateLimitConfig) -> f64 {
    config.refill_rate()
}

pub(crate) fn capacity(config: &RateLimitConfig) -> f64 {
    config.capacity()
}
