//! Cache storage backends.
//!
//! The coordinated cache talks to storage through [`CacheStore`]. Two
//! implementations exist:
//!
//! - **Redis**: shared by every serving node. Required for multi-node
//!   deployments, since invalidation must be visible fleet-wide.
//! - **Local**: a DashMap inside this process, for single-instance
//!   deployments and tests.
//!
//! Redis mode has no per-process layer in front of it: a delete issued on one
//! node must be visible on every other node on the next read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::error::Result;

/// Lua script releasing a lock only if we still own it.
const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Lua script storing a value only if the key still holds what the caller
/// last saw. `ARGV[3] == '1'` means the caller saw `ARGV[4]`, otherwise it
/// saw nothing.
const SET_IF_UNCHANGED: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[3] == '1' then
    if current ~= ARGV[4] then
        return 0
    end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

/// Storage operations needed by the coordinated cache.
///
/// Every operation must be atomic with respect to other processes sharing
/// the store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get raw bytes for `key`, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Store `value` only if `key` is absent. Returns `true` if stored.
    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Store `value` only if `key` still holds `expected` (`None`: absent).
    /// Returns `true` if stored.
    async fn set_if_unchanged(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        expected: Option<&[u8]>,
    ) -> Result<bool>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove `key` only if it currently holds `expected`. Returns `true` if removed.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;
}

/// A locally stored entry with TTL support.
///
/// The data is wrapped in `Arc` so cache hits don't copy the bytes.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Cache storage backend.
#[derive(Clone, Debug)]
pub enum CacheBackend {
    /// Single-instance: local DashMap only
    Local(Arc<DashMap<String, CachedEntry>>),

    /// Multi-instance: Redis shared by every node
    Redis(Pool),
}

impl CacheBackend {
    /// Create a new local-only cache backend.
    pub fn new_local() -> Self {
        CacheBackend::Local(Arc::new(DashMap::new()))
    }

    /// Create a new Redis-backed cache backend.
    pub fn new_redis(redis_pool: Pool) -> Self {
        CacheBackend::Redis(redis_pool)
    }

    /// Returns `true` if the store is shared across processes.
    pub fn is_shared(&self) -> bool {
        matches!(self, CacheBackend::Redis(_))
    }

    /// Check if Redis is available (for health checks).
    pub async fn is_redis_available(&self) -> bool {
        match self {
            CacheBackend::Local(_) => false,
            CacheBackend::Redis(redis) => redis.get().await.is_ok(),
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        match self {
            CacheBackend::Local(map) => CacheStats {
                local_entries: map.len(),
                mode: "local".to_string(),
            },
            CacheBackend::Redis(_) => CacheStats {
                local_entries: 0,
                mode: "redis".to_string(),
            },
        }
    }
}

#[async_trait]
impl CacheStore for CacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            CacheBackend::Local(map) => {
                if let Some(entry) = map.get(key) {
                    if !entry.is_expired() {
                        return Ok(Some(entry.data.as_ref().clone()));
                    }
                    // Remove expired entry
                    drop(entry);
                    map.remove_if(key, |_, e| e.is_expired());
                }
                Ok(None)
            }
            CacheBackend::Redis(redis) => {
                let mut conn = redis.get().await?;
                let data: Option<Vec<u8>> = conn.get(key).await?;
                Ok(data)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        match self {
            CacheBackend::Local(map) => {
                map.insert(key.to_string(), CachedEntry::new(value.to_vec(), ttl));
                Ok(())
            }
            CacheBackend::Redis(redis) => {
                let mut conn = redis.get().await?;
                conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?;
                tracing::debug!(key = %key, ttl_ms = ttl_millis(ttl), "cache set");
                Ok(())
            }
        }
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        match self {
            CacheBackend::Local(map) => match map.entry(key.to_string()) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().is_expired() {
                        occupied.insert(CachedEntry::new(value.to_vec(), ttl));
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(CachedEntry::new(value.to_vec(), ttl));
                    Ok(true)
                }
            },
            CacheBackend::Redis(redis) => {
                let mut conn = redis.get().await?;
                // SET key value NX PX ttl: atomic set-if-not-exists with expiry
                let reply: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await?;
                Ok(reply.is_some())
            }
        }
    }

    async fn set_if_unchanged(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        expected: Option<&[u8]>,
    ) -> Result<bool> {
        match self {
            CacheBackend::Local(map) => match map.entry(key.to_string()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get();
                    let current = (!entry.is_expired()).then(|| entry.data.as_slice());
                    if current != expected {
                        return Ok(false);
                    }
                    occupied.insert(CachedEntry::new(value.to_vec(), ttl));
                    Ok(true)
                }
                Entry::Vacant(vacant) => {
                    if expected.is_some() {
                        return Ok(false);
                    }
                    vacant.insert(CachedEntry::new(value.to_vec(), ttl));
                    Ok(true)
                }
            },
            CacheBackend::Redis(redis) => {
                let mut conn = redis.get().await?;
                let stored: i64 = redis::Script::new(SET_IF_UNCHANGED)
                    .key(key)
                    .arg(value)
                    .arg(ttl_millis(ttl))
                    .arg(if expected.is_some() { "1" } else { "0" })
                    .arg(expected.unwrap_or_default())
                    .invoke_async(&mut conn)
                    .await?;
                Ok(stored > 0)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            CacheBackend::Local(map) => {
                map.remove(key);
                tracing::debug!(key = %key, "cache deleted (local)");
                Ok(())
            }
            CacheBackend::Redis(redis) => {
                let mut conn = redis.get().await?;
                conn.del::<_, ()>(key).await?;
                tracing::debug!(key = %key, "cache deleted (redis)");
                Ok(())
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        match self {
            CacheBackend::Local(map) => {
                Ok(map
                    .remove_if(key, |_, entry| entry.data.as_slice() == expected)
                    .is_some())
            }
            CacheBackend::Redis(redis) => {
                let mut conn = redis.get().await?;
                let removed: i64 = redis::Script::new(RELEASE_IF_OWNER)
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(removed > 0)
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub local_entries: usize,
    pub mode: String,
}
