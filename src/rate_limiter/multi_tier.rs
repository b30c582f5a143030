//! Layered rate limiting: per-tier quotas (e.g. free/pro/enterprise) and
//! per-endpoint overrides stacked on top of a shared backend.

use std::collections::HashMap;
use std::sync::Arc;

use super::backend::{RateLimitBackend, RateLimitConfig};
use super::{RateLimitResponse, RateLimiter};
use crate::clock::SharedClock;
use crate::error::Result;

/// A rate limiter keyed by an arbitrary "tier" label, each tier carrying its
/// own [`RateLimitConfig`] (e.g. a generous limit for `"enterprise"`, a
/// strict one for `"free"`).
pub struct MultiTierRateLimiter {
    tiers: HashMap<String, RateLimiter>,
    default_tier: String,
}

impl MultiTierRateLimiter {
    /// Build a multi-tier limiter. `tiers` maps a tier name to its config;
    /// `default_tier` is used when [`check`](Self::check) is called with a
    /// tier name not present in the map.
    pub fn new(
        tiers: HashMap<String, RateLimitConfig>,
        default_tier: impl Into<String>,
        backend: Arc<dyn RateLimitBackend>,
        clock: SharedClock,
    ) -> Self {
        let limiters = tiers
            .into_iter()
            .map(|(name, config)| (name, RateLimiter::new(config, backend.clone(), clock.clone())))
            .collect();
        Self {
            tiers: limiters,
            default_tier: default_tier.into(),
        }
    }

    /// Check `key` against the named tier's quota, falling back to the
    /// default tier if `tier` is unknown.
    pub async fn check(&self, tier: &str, key: &str) -> Result<RateLimitResponse> {
        let limiter = self
            .tiers
            .get(tier)
            .or_else(|| self.tiers.get(&self.default_tier))
            .ok_or_else(|| crate::Error::config(format!("no rate limit tier configured for '{tier}'")))?;
        limiter.check(key).await
    }

    /// Reset the named tier's counter for `key`.
    pub async fn reset(&self, tier: &str, key: &str) -> Result<()> {
        if let Some(limiter) = self.tiers.get(tier) {
            limiter.reset(key).await
        } else {
            Ok(())
        }
    }
}

/// A rate limiter keyed by HTTP endpoint path, with a fallback limiter for
/// paths not explicitly configured.
pub struct EndpointRateLimiter {
    endpoints: HashMap<String, RateLimiter>,
    fallback: RateLimiter,
}

impl EndpointRateLimiter {
    /// Build an endpoint limiter. Endpoints not present in `endpoints` fall
    /// back to `fallback_config`.
    pub fn new(
        endpoints: HashMap<String, RateLimitConfig>,
        fallback_config: RateLimitConfig,
        backend: Arc<dyn RateLimitBackend>,
        clock: SharedClock,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(path, config)| (path, RateLimiter::new(config, backend.clone(), clock.clone())))
            .collect();
        let fallback = RateLimiter::new(fallback_config, backend, clock);
        Self { endpoints, fallback }
    }

    /// Check `key` (typically a client identifier) against the limiter
    /// configured for `endpoint`, or the fallback limiter.
    pub async fn check(&self, endpoint: &str, key: &str) -> Result<RateLimitResponse> {
        let combined_key = format!("{endpoint}:{key}");
        match self.endpoints.get(endpoint) {
            Some(limiter) => limiter.check(&combined_key).await,
            None => self.fallback.check(&combined_key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::rate_limiter::memory::InMemoryBackend;

    fn clock() -> SharedClock {
        Arc::new(FixedClock::new(0.0))
    }

    fn backend() -> Arc<dyn RateLimitBackend> {
        Arc::new(InMemoryBackend::new())
    }

    #[tokio::test]
    async fn test_multi_tier_uses_named_tier_limit() {
        let mut tiers = HashMap::new();
        tiers.insert("free".to_string(), RateLimitConfig::sliding_window(1, 60.0));
        tiers.insert("pro".to_string(), RateLimitConfig::sliding_window(100, 60.0));
        let limiter = MultiTierRateLimiter::new(tiers, "free", backend(), clock());

        let r1 = limiter.check("free", "user-1").await.unwrap();
        assert!(r1.allowed);
        let r2 = limiter.check("free", "user-1").await.unwrap();
        assert!(!r2.allowed);

        let r3 = limiter.check("pro", "user-2").await.unwrap();
        assert!(r3.allowed);
    }

    #[tokio::test]
    async fn test_multi_tier_unknown_tier_falls_back_to_default() {
        let mut tiers = HashMap::new();
        tiers.insert("free".to_string(), RateLimitConfig::sliding_window(1, 60.0));
        let limiter = MultiTierRateLimiter::new(tiers, "free", backend(), clock());

        let r1 = limiter.check("nonexistent", "user-1").await.unwrap();
        assert!(r1.allowed);
    }

    #[tokio::test]
    async fn test_endpoint_limiter_isolates_endpoints() {
        let mut endpoints = HashMap::new();
        endpoints.insert("/chat".to_string(), RateLimitConfig::sliding_window(1, 60.0));
        let limiter = EndpointRateLimiter::new(
            endpoints,
            RateLimitConfig::sliding_window(10, 60.0),
            backend(),
            clock(),
        );

        let chat1 = limiter.check("/chat", "user-1").await.unwrap();
        assert!(chat1.allowed);
        let chat2 = limiter.check("/chat", "user-1").await.unwrap();
        assert!(!chat2.allowed);

        // A different endpoint uses the fallback config and is unaffected.
        let other = limiter.check("/health", "user-1").await.unwrap();
        assert!(other.allowed);
    }
}
