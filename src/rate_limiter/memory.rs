//! In-process rate-limit backend: a mutex-guarded map, atomic under
//! contention via a short critical section per key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{RateLimitBackend, SlidingWindowOutcome, TokenBucketOutcome};
use crate::error::Result;

struct SlidingWindowState {
    /// (timestamp, tiebreaker) pairs, kept sorted by insertion order.
    entries: Vec<(f64, u64)>,
}

struct TokenBucketState {
    tokens: f64,
    last_update: f64,
}

/// Single-process, mutex-guarded rate-limit backend.
///
/// Every operation completes synchronously under a short lock and never
/// suspends, matching the "in-memory primitive operations are non-blocking"
/// rule in the concurrency model: the `async fn` signature exists only to
/// satisfy the shared [`RateLimitBackend`] trait, not because the method
/// itself awaits anything.
pub struct InMemoryBackend {
    windows: Mutex<HashMap<String, SlidingWindowState>>,
    buckets: Mutex<HashMap<String, TokenBucketState>>,
    tiebreaker: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Create an empty in-memory backend. The caller (a [`super::RateLimiter`])
    /// owns the clock and supplies `now` explicitly to every call.
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            tiebreaker: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryBackend {
    async fn check_sliding_window(
        &self,
        key: &str,
        window_seconds: f64,
        now: f64,
    ) -> Result<SlidingWindowOutcome> {
        let mut windows = self.windows.lock();
        let state = windows.entry(key.to_string()).or_insert_with(|| SlidingWindowState {
            entries: Vec::new(),
        });

        let cutoff = now - window_seconds;
        state.entries.retain(|(ts, _)| *ts > cutoff);

        let tie = self.tiebreaker.fetch_add(1, Ordering::SeqCst);
        state.entries.push((now, tie));

        let count_after = state.entries.len() as u64;
        let reset_at = state
            .entries
            .first()
            .map(|(ts, _)| ts + window_seconds)
            .unwrap_or(now + window_seconds);

        Ok(SlidingWindowOutcome {
            count_after,
            reset_at,
        })
    }

    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now: f64,
    ) -> Result<TokenBucketOutcome> {
        let mut buckets = self.buckets.lock();
        let state = buckets.entry(key.to_string()).or_insert_with(|| TokenBucketState {
            tokens: capacity,
            last_update: now,
        });

        let elapsed = (now - state.last_update).max(0.0);
        let refilled = (state.tokens + elapsed * refill_rate).min(capacity);

        if refilled >= cost {
            state.tokens = refilled - cost;
            state.last_update = now;
            Ok(TokenBucketOutcome {
                allowed: true,
                tokens_remaining: state.tokens,
                retry_after: 0.0,
            })
        } else {
            state.tokens = refilled;
            state.last_update = now;
            let retry_after = if refill_rate > 0.0 {
                (cost - refilled) / refill_rate
            } else {
                f64::INFINITY
            };
            Ok(TokenBucketOutcome {
                allowed: false,
                tokens_remaining: refilled,
                retry_after,
            })
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.windows.lock().remove(key);
        self.buckets.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sliding_window_allows_up_to_limit() {
        let backend = InMemoryBackend::new();
        // limit enforcement lives in RateLimiter; here we just check counting.
        let o1 = backend.check_sliding_window("k", 10.0, 0.0).await.unwrap();
        let o2 = backend.check_sliding_window("k", 10.0, 0.0).await.unwrap();
        let o3 = backend.check_sliding_window("k", 10.0, 0.0).await.unwrap();
        assert_eq!(o1.count_after, 1);
        assert_eq!(o2.count_after, 2);
        assert_eq!(o3.count_after, 3);
    }

    #[tokio::test]
    async fn test_sliding_window_evicts_old_entries() {
        let backend = InMemoryBackend::new();
        backend.check_sliding_window("k", 10.0, 0.0).await.unwrap();
        backend.check_sliding_window("k", 10.0, 1.0).await.unwrap();
        // Both entries fall out of the window once we've moved past t=11.
        let outcome = backend.check_sliding_window("k", 10.0, 11.5).await.unwrap();
        assert_eq!(outcome.count_after, 1);
    }

    #[tokio::test]
    async fn test_token_bucket_refill_and_consume() {
        let backend = InMemoryBackend::new();
        // capacity 10, refill 1/s
        let first = backend
            .check_token_bucket("k", 10.0, 1.0, 10.0, 0.0)
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.tokens_remaining, 0.0);

        // No time elapsed: bucket still empty, denied.
        let second = backend
            .check_token_bucket("k", 10.0, 1.0, 1.0, 0.0)
            .await
            .unwrap();
        assert!(!second.allowed);

        // After 5s at refill rate 1/s, 5 tokens are available.
        let third = backend
            .check_token_bucket("k", 10.0, 1.0, 3.0, 5.0)
            .await
            .unwrap();
        assert!(third.allowed);
        assert_eq!(third.tokens_remaining, 2.0);
    }

    #[tokio::test]
    async fn test_token_bucket_never_exceeds_capacity() {
        let backend = InMemoryBackend::new();
        backend
            .check_token_bucket("k", 5.0, 1.0, 0.0, 0.0)
            .await
            .unwrap();
        // A huge elapsed time should still cap refill at capacity.
        let outcome = backend
            .check_token_bucket("k", 5.0, 1.0, 0.0, 10_000.0)
            .await
            .unwrap();
        assert_eq!(outcome.tokens_remaining, 5.0);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let backend = InMemoryBackend::new();
        backend.check_sliding_window("k", 10.0, 0.0).await.unwrap();
        backend.reset("k").await.unwrap();
        let outcome = backend.check_sliding_window("k", 10.0, 0.0).await.unwrap();
        assert_eq!(outcome.count_after, 1);
    }
}
