//! TTL cache: an expiring key-value store over a pluggable backend
//! (in-process LRU or a shared Redis instance), the storage layer
//! [`crate::session`] builds conversation sessions on top of.

use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::Result;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: u64,
}

impl CacheStats {
    /// Fraction of lookups that were hits, `0.0` when nothing has been
    /// looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The backend contract an in-memory or remote cache store must provide.
///
/// Values cross this boundary as JSON so the same trait covers both a
/// process-local store (which could keep the native value but doesn't, to
/// keep the two backends interchangeable) and Redis (which has no other
/// option for arbitrary structures).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<u64>;
    fn stats(&self) -> CacheStats;
}

struct Entry {
    value: Vec<u8>,
    expires_at: f64,
}

struct MemoryState {
    cache: LruCache<String, Entry>,
    stats: CacheStats,
}

/// In-process cache backend: an LRU map guarded by a short-held lock.
///
/// Expiration is checked lazily on `get`/`exists`; nothing sweeps the map in
/// the background. Eviction on overflow is handled by the `lru` crate's
/// move-to-end-on-access ordering.
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    clock: SharedClock,
}

impl InMemoryBackend {
    pub fn new(max_size: usize, clock: SharedClock) -> Self {
        let capacity = std::num::NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            state: Mutex::new(MemoryState {
                cache: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            clock,
        }
    }

    /// Remove every entry whose TTL has already elapsed. Not required for
    /// correctness (reads already check expiry) but bounds memory held by
    /// keys nobody ever reads again.
    pub fn cleanup_expired(&self) -> u64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .cache
            .iter()
            .filter(|(_, entry)| now > entry.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.cache.pop(key);
        }
        state.stats.expirations += expired.len() as u64;
        state.stats.size = state.cache.len() as u64;
        expired.len() as u64
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(entry) = state.cache.get(key) else {
            state.stats.misses += 1;
            return Ok(None);
        };
        if now > entry.expires_at {
            state.cache.pop(key);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            return Ok(None);
        }
        let value = entry.value.clone();
        state.stats.hits += 1;
        Ok(Some(value))
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.cache.len();
        state.cache.put(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl_seconds as f64,
            },
        );
        if state.cache.len() <= before {
            state.stats.evictions += 1;
        }
        state.stats.size = state.cache.len() as u64;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = state.cache.pop(key).is_some();
        state.stats.size = state.cache.len() as u64;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.cache.peek(key) {
            Some(entry) if now <= entry.expires_at => Ok(true),
            Some(_) => {
                state.cache.pop(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let count = state.cache.len() as u64;
        state.cache.clear();
        state.stats.size = 0;
        Ok(count)
    }

    fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }
}

/// Redis-backed cache: each key lives under `{prefix}:{key}`, TTL enforced
/// by Redis's own `SETEX` rather than an application-level sweep.
pub struct RedisBackend {
    manager: ConnectionManager,
    prefix: String,
    stats: Mutex<CacheStats>,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(crate::Error::Store)?;
        let manager = ConnectionManager::new(client).await.map_err(crate::Error::Store)?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let full_key = self.make_key(key);
        let value: Option<Vec<u8>> = conn.get(&full_key).await.map_err(crate::Error::Store)?;
        let mut stats = self.stats.lock();
        if value.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let full_key = self.make_key(key);
        let ttl = ttl_seconds.max(1);
        let _: () = conn.set_ex(&full_key, value, ttl).await.map_err(crate::Error::Store)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let full_key = self.make_key(key);
        let removed: u64 = conn.del(&full_key).await.map_err(crate::Error::Store)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let full_key = self.make_key(key);
        let exists: bool = conn.exists(&full_key).await.map_err(crate::Error::Store)?;
        Ok(exists)
    }

    async fn clear(&self) -> Result<u64> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = conn.keys(&pattern).await.map_err(crate::Error::Store)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len() as u64;
        let _: () = conn.del(&keys).await.map_err(crate::Error::Store)?;
        Ok(count)
    }

    fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }
}

/// High-level typed cache over a [`CacheBackend`]: the JSON (de)serialization
/// boundary every caller actually wants, rather than raw bytes.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    default_ttl_seconds: u64,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl_seconds: u64) -> Self {
        Self { backend, default_ttl_seconds }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.backend.get_raw(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&raw)?;
        Ok(Some(value))
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: Option<u64>) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        self.backend.set_raw(key, raw, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key).await
    }

    /// Return the cached value at `key`, or call `factory` to create one,
    /// store it, and return it. Not atomic: a concurrent caller racing
    /// between the miss and the store can overwrite each other's writes.
    pub async fn get_or_create<T, F>(&self, key: &str, factory: F, ttl_seconds: Option<u64>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get(key).await? {
            return Ok(existing);
        }
        let value = factory();
        self.set(key, &value, ttl_seconds).await?;
        Ok(value)
    }

    /// Load `key`, apply `updater`, and store the result. Returns `None` if
    /// `key` doesn't exist yet. Same non-atomic read-modify-write caveat as
    /// [`Cache::get_or_create`].
    pub async fn update<T, F>(&self, key: &str, updater: F, ttl_seconds: Option<u64>) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let Some(existing) = self.get::<T>(key).await? else {
            return Ok(None);
        };
        let updated = updater(existing);
        self.set(key, &updated, ttl_seconds).await?;
        Ok(Some(updated))
    }

    pub async fn clear(&self) -> Result<u64> {
        self.backend.clear().await
    }

    pub fn stats(&self) -> CacheStats {
        self.backend.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Session {
        user: String,
        count: u32,
    }

    fn cache(clock: Arc<FixedClock>) -> Cache {
        Cache::new(Arc::new(InMemoryBackend::new(4, clock)), 60)
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrips() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        let session = Session { user: "alice".into(), count: 1 };
        c.set("k", &session, None).await.unwrap();
        let fetched: Session = c.get("k").await.unwrap().unwrap();
        assert_eq!(fetched, session);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock.clone());
        c.set("k", &Session { user: "a".into(), count: 0 }, Some(10)).await.unwrap();
        clock.advance(11.0);
        let fetched: Option<Session> = c.get("k").await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_on_overflow() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        for i in 0..4 {
            c.set(&format!("k{i}"), &i, None).await.unwrap();
        }
        // Touch k1..k3 so k0 is the least recently used.
        let _: Option<i32> = c.get("k1").await.unwrap();
        let _: Option<i32> = c.get("k2").await.unwrap();
        let _: Option<i32> = c.get("k3").await.unwrap();
        c.set("k4", &4, None).await.unwrap();
        let evicted: Option<i32> = c.get("k0").await.unwrap();
        assert!(evicted.is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_only_calls_factory_once() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        let v: Session = c
            .get_or_create("k", || Session { user: "a".into(), count: 0 }, None)
            .await
            .unwrap();
        assert_eq!(v.count, 0);
        let v2: Session = c
            .get_or_create("k", || Session { user: "a".into(), count: 99 }, None)
            .await
            .unwrap();
        assert_eq!(v2.count, 0);
    }

    #[tokio::test]
    async fn test_update_mutates_existing_entry() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        c.set("k", &Session { user: "a".into(), count: 0 }, None).await.unwrap();
        let updated: Option<Session> = c
            .update(
                "k",
                |mut s: Session| {
                    s.count += 1;
                    s
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_update_missing_key_returns_none() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        let updated: Option<Session> = c.update("missing", |s: Session| s, None).await.unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        c.set("k", &1i32, None).await.unwrap();
        assert!(c.exists("k").await.unwrap());
        assert!(c.delete("k").await.unwrap());
        assert!(!c.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        c.set("a", &1i32, None).await.unwrap();
        c.set("b", &2i32, None).await.unwrap();
        let cleared = c.clear().await.unwrap();
        assert_eq!(cleared, 2);
        assert!(!c.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let clock = Arc::new(FixedClock::new(0.0));
        let c = cache(clock);
        c.set("k", &1i32, None).await.unwrap();
        let _: Option<i32> = c.get("k").await.unwrap();
        let _: Option<i32> = c.get("missing").await.unwrap();
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_cleanup_expired_counts_removed_entries() {
        let clock = Arc::new(FixedClock::new(0.0));
        let backend = InMemoryBackend::new(4, clock.clone());
        futures::executor::block_on(backend.set_raw("a", b"1".to_vec(), 5)).unwrap();
        clock.advance(10.0);
        let removed = backend.cleanup_expired();
        assert_eq!(removed, 1);
    }
}
