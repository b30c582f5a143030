//! Distributed rate-limit backend over a Redis-compatible store.
//!
//! Both operations are single server-side Lua scripts: the script *is* the
//! atomic unit, so no client-side lock is needed around the round trip.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::backend::{RateLimitBackend, SlidingWindowOutcome, TokenBucketOutcome};
use crate::error::Result;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local tiebreaker = ARGV[3]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
redis.call('ZADD', key, now, now .. ':' .. tiebreaker)
redis.call('EXPIRE', key, math.ceil(window) + 1)

local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local reset_at
if oldest[2] then
    reset_at = tonumber(oldest[2]) + window
else
    reset_at = now + window
end

return {count, tostring(reset_at)}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(bucket[1]) or capacity
local last_update = tonumber(bucket[2]) or now

local elapsed = math.max(now - last_update, 0)
local refilled = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
local remaining = refilled
if refilled >= cost then
    allowed = 1
    remaining = refilled - cost
end

redis.call('HMSET', key, 'tokens', remaining, 'last_update', now)
local ttl = math.ceil(capacity / math.max(refill_rate, 0.0001)) + 1
redis.call('EXPIRE', key, ttl)

return {allowed, tostring(remaining)}
"#;

/// Redis-backed rate limiter store, for cluster-wide quota enforcement.
pub struct RedisBackend {
    manager: ConnectionManager,
    prefix: String,
    sliding_window_script: Script,
    token_bucket_script: Script,
}

impl RedisBackend {
    /// Connect to `redis_url` (e.g. `redis://127.0.0.1/`), creating the
    /// connection pool lazily as the underlying client requires. Every key
    /// this backend touches lives under `{prefix}:{key}` so a rate limiter
    /// sharing a Redis instance with other primitives (or another
    /// independently configured limiter) cannot collide on identical keys.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url).map_err(crate::Error::Store)?;
        let manager = ConnectionManager::new(client).await.map_err(crate::Error::Store)?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            sliding_window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            token_bucket_script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn check_sliding_window(
        &self,
        key: &str,
        window_seconds: f64,
        now: f64,
    ) -> Result<SlidingWindowOutcome> {
        let mut conn = self.manager.clone();
        let tiebreaker: u64 = rand::random();
        let (count, reset_at): (u64, String) = self
            .sliding_window_script
            .key(self.make_key(key))
            .arg(window_seconds)
            .arg(now)
            .arg(tiebreaker)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::Error::Store)?;

        Ok(SlidingWindowOutcome {
            count_after: count,
            reset_at: reset_at.parse().unwrap_or(now + window_seconds),
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
        let mut conn = self.manager.clone();
        let (allowed, remaining): (i64, String) = self
            .token_bucket_script
            .key(self.make_key(key))
            .arg(capacity)
            .arg(refill_rate)
            .arg(cost)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::Error::Store)?;

        let tokens_remaining: f64 = remaining.parse().unwrap_or(0.0);
        let retry_after = if allowed == 1 || refill_rate <= 0.0 {
            0.0
        } else {
            (cost - tokens_remaining) / refill_rate
        };

        Ok(TokenBucketOutcome {
            allowed: allowed == 1,
            tokens_remaining,
            retry_after,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(self.make_key(key)).await.map_err(crate::Error::Store)?;
        Ok(())
    }
}
