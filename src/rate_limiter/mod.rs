//! Rate limiting: sliding-window and token-bucket quota enforcement over a
//! pluggable backend (in-process or a shared remote store).

mod backend;
mod memory;
mod multi_tier;
mod remote;

pub use backend::{
    RateLimitAlgorithm, RateLimitBackend, RateLimitConfig, RateLimitResult, SlidingWindowOutcome,
    TokenBucketOutcome,
};
pub use memory::InMemoryBackend;
pub use multi_tier::{EndpointRateLimiter, MultiTierRateLimiter};
pub use remote::RedisBackend;

use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// Response to a single rate-limit check, carrying enough detail to build
/// standard `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResponse {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Configured limit for the window or bucket.
    pub limit: u64,
    /// Requests/tokens remaining after this check.
    pub remaining: f64,
    /// Unix timestamp (seconds) when the limit resets.
    pub reset_at: f64,
    /// Seconds the caller should wait before retrying, when denied.
    pub retry_after_secs: f64,
}

/// A configured rate limiter: config, backend, and clock bound together.
///
/// The limiter is the sole clock consumer: it reads `now` once per check and
/// passes it down to the backend, which treats `now` as an opaque parameter.
/// This keeps backends free of any notion of wall-clock time, which matters
/// for the remote backend (the server-side script has no access to the
/// client's clock abstraction at all).
pub struct RateLimiter {
    config: RateLimitConfig,
    backend: Arc<dyn RateLimitBackend>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Build a rate limiter from a config, backend, and clock.
    pub fn new(config: RateLimitConfig, backend: Arc<dyn RateLimitBackend>, clock: SharedClock) -> Self {
        Self { config, backend, clock }
    }

    /// Check whether `key` is within quota, recording this request if so.
    pub async fn check(&self, key: &str) -> Result<RateLimitResponse> {
        let now = self.clock.now();
        match self.config.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                let outcome = self
                    .backend
                    .check_sliding_window(key, self.config.window_seconds, now)
                    .await?;
                let allowed = outcome.count_after <= self.config.limit;
                let remaining = (self.config.limit as f64 - outcome.count_after as f64).max(0.0);
                let retry_after_secs = if allowed { 0.0 } else { (outcome.reset_at - now).max(0.0) };
                Ok(RateLimitResponse {
                    allowed,
                    limit: self.config.limit,
                    remaining,
                    reset_at: outcome.reset_at,
                    retry_after_secs,
                })
            }
            RateLimitAlgorithm::TokenBucket => {
                let capacity = backend::capacity(&self.config);
                let refill_rate = backend::refill_rate(&self.config);
                let outcome = self
                    .backend
                    .check_token_bucket(key, capacity, refill_rate, self.config.cost as f64, now)
                    .await?;
                Ok(RateLimitResponse {
                    allowed: outcome.allowed,
                    limit: self.config.limit,
                    remaining: outcome.tokens_remaining,
                    reset_at: now + outcome.retry_after,
                    retry_after_secs: outcome.retry_after,
                })
            }
        }
    }

    /// Check `key` and return `Err(Error::RateLimited)` when denied, the
    /// convenience form for call sites that just want a pass/fail gate.
    pub async fn enforce(&self, key: &str) -> Result<RateLimitResponse> {
        let response = self.check(key).await?;
        if response.allowed {
            Ok(response)
        } else {
            Err(Error::rate_limited(key, response.retry_after_secs))
        }
    }

    /// Standard `X-RateLimit-*` header values for `response`.
    pub fn headers(&self, response: &RateLimitResponse) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", response.limit.to_string()),
            ("X-RateLimit-Remaining", format!("{:.0}", response.remaining)),
            ("X-RateLimit-Reset", format!("{:.0}", response.reset_at)),
        ];
        if !response.allowed {
            headers.push(("Retry-After", format!("{:.0}", response.retry_after_secs)));
        }
        headers
    }

    /// Clear this limiter's counter for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.backend.reset(key).await
    }
}
