//! Get-or-compute with stale reads and single-flight refill.
//!
//! ## Key States
//!
//! ```text
//! ABSENT ──refill──▶ FRESH ──ttl──▶ STALE ──refill──▶ FRESH
//!    ▲                 │               │
//!    └─────delete──────┴───────────────┘
//! ```
//!
//! - **FRESH** (`age <= ttl`): returned as is.
//! - **STALE** (`ttl < age <= ttl + stale`): the caller that wins the refill
//!   lock recomputes; everyone else gets the stale value immediately.
//! - **ABSENT**: the lock winner computes; everyone else polls the store for
//!   up to `busy_wait` and then computes without caching.
//!
//! The refill lock is `SET {key}:lock <token> NX PX <stale>` against the
//! shared store, so it holds across processes and nodes. The lease expires on
//! its own if the lock holder dies.
//!
//! ## Graceful Degradation
//!
//! If the store errors, the value is computed directly and not cached. The
//! permission check stays available; stampede protection is lost until the
//! store recovers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::CacheStore;
use crate::error::{CacheError, RefillError};
use crate::metrics;

/// Default time an entry is considered fresh.
pub const DEFAULT_FRESH_TTL: Duration = Duration::from_secs(120);

/// Default stale window, also the refill lock lease.
pub const DEFAULT_STALE_TTL: Duration = Duration::from_secs(300);

const DEFAULT_BUSY_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Freshness settings for one `get_or_compute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillPolicy {
    /// How long a value is served without refresh.
    pub ttl: Duration,
    /// How long past `ttl` a value may still be served while one caller
    /// refreshes it. Also the lease of the refill lock.
    pub stale: Duration,
}

impl RefillPolicy {
    pub const fn new(ttl: Duration, stale: Duration) -> Self {
        Self { ttl, stale }
    }

    /// TTL handed to the store; entries outlive `ttl` so stale reads work.
    pub fn storage_ttl(&self) -> Duration {
        self.ttl + self.stale
    }
}

impl Default for RefillPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FRESH_TTL, DEFAULT_STALE_TTL)
    }
}

/// Stored form of a key: a value, or the marker a delete leaves behind.
#[derive(Serialize, Deserialize)]
enum Slot<T> {
    Value { value: T, stored_at_ms: i64 },
    Purged { token: String },
}

enum Lookup<T> {
    Found { value: T, age: Duration },
    Missing,
    Unavailable,
}

enum Lock {
    Acquired(Vec<u8>),
    Busy,
    Unavailable,
}

enum Wait<T> {
    Ready(T),
    Acquired(Vec<u8>),
    GaveUp(&'static str),
}

/// Cache with TTL, stale reads and single-flight refill over a shared store.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use globalperms_cache::{CacheBackend, CoordinatedCache, RefillPolicy};
///
/// let cache = CoordinatedCache::new(Arc::new(CacheBackend::new_local()));
/// let groups: Vec<String> = cache
///     .get_or_compute("global:globalpermissions:metawiki:42", RefillPolicy::default(), || async {
///         Ok::<_, std::io::Error>(vec!["sysop".to_string()])
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct CoordinatedCache {
    store: Arc<dyn CacheStore>,
    busy_wait: Duration,
    poll_interval: Duration,
    purge_hold: Duration,
}

impl CoordinatedCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            busy_wait: DEFAULT_BUSY_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            purge_hold: DEFAULT_STALE_TTL,
        }
    }

    /// How long callers without a stale value wait for another caller's refill.
    #[must_use]
    pub fn with_busy_wait(mut self, busy_wait: Duration, poll_interval: Duration) -> Self {
        self.busy_wait = busy_wait;
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// How long a delete keeps rejecting refills that started before it.
    /// Must cover the refill lock lease.
    #[must_use]
    pub fn with_purge_hold(mut self, purge_hold: Duration) -> Self {
        self.purge_hold = purge_hold.max(Duration::from_millis(1));
        self
    }

    /// Key of the refill lock guarding `key`.
    pub fn lock_key(key: &str) -> String {
        format!("{key}:lock")
    }

    /// Return the cached value for `key`, computing it if needed.
    ///
    /// `compute` runs on a spawned task when this caller holds the refill
    /// lock, so dropping the returned future does not stop the refill.
    ///
    /// # Errors
    ///
    /// Returns `RefillError::Compute` if this caller ran `compute` and it
    /// failed. Other callers are never handed that error.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        policy: RefillPolicy,
        compute: F,
    ) -> Result<T, RefillError<E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        match self.lookup::<T>(key).await {
            Lookup::Found { value, age } if age <= policy.ttl => {
                debug!(key = %key, "cache hit (fresh)");
                metrics::record_cache_hit("fresh");
                return Ok(value);
            }
            Lookup::Found { value, age } if age <= policy.storage_ttl() => {
                return match self.try_lock(key, policy.stale).await {
                    Lock::Acquired(token) => self.refill_or_reuse(key, policy, token, compute).await,
                    Lock::Busy => {
                        debug!(key = %key, age_ms = age.as_millis() as u64, "cache hit (stale, refill in progress)");
                        metrics::record_cache_hit("stale");
                        Ok(value)
                    }
                    Lock::Unavailable => self.compute_uncached(key, "lock_unavailable", compute).await,
                };
            }
            Lookup::Found { .. } | Lookup::Missing => {
                debug!(key = %key, "cache miss");
                metrics::record_cache_miss();
            }
            Lookup::Unavailable => {
                return self.compute_uncached(key, "store_unavailable", compute).await;
            }
        }

        match self.try_lock(key, policy.stale).await {
            Lock::Acquired(token) => self.refill_or_reuse(key, policy, token, compute).await,
            Lock::Busy => match self.wait_for_refill::<T>(key, policy).await {
                Wait::Ready(value) => Ok(value),
                Wait::Acquired(token) => self.refill_or_reuse(key, policy, token, compute).await,
                Wait::GaveUp(reason) => self.compute_uncached(key, reason, compute).await,
            },
            Lock::Unavailable => self.compute_uncached(key, "lock_unavailable", compute).await,
        }
    }

    /// Delete `key` for every node sharing the store.
    ///
    /// The entry is replaced by a purge marker that reads as a miss. A refill
    /// that began before the delete will not store its result over it.
    /// Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let marker = rmp_serde::to_vec(&Slot::<()>::Purged {
            token: Uuid::new_v4().to_string(),
        })?;
        self.store.set(key, &marker, self.purge_hold).await
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => decode(key, &bytes),
            Ok(None) => Lookup::Missing,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache store GET failed");
                Lookup::Unavailable
            }
        }
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Lock {
        let token = Uuid::new_v4().to_string().into_bytes();
        match self.store.add(&Self::lock_key(key), &token, lease).await {
            Ok(true) => Lock::Acquired(token),
            Ok(false) => Lock::Busy,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to acquire refill lock");
                Lock::Unavailable
            }
        }
    }

    async fn release(&self, key: &str, token: &[u8]) {
        release_lock(self.store.as_ref(), key, token).await;
    }

    /// Refill under the lock, unless another caller refilled between our
    /// read and the lock acquisition.
    async fn refill_or_reuse<T, E, F, Fut>(
        &self,
        key: &str,
        policy: RefillPolicy,
        token: Vec<u8>,
        compute: F,
    ) -> Result<T, RefillError<E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let seen = match self.store.get(key).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache store GET failed");
                self.release(key, &token).await;
                return self.compute_uncached(key, "store_unavailable", compute).await;
            }
        };

        if let Some(bytes) = &seen
            && let Lookup::Found { value, age } = decode::<T>(key, bytes)
            && age <= policy.ttl
        {
            self.release(key, &token).await;
            metrics::record_cache_hit("refilled");
            return Ok(value);
        }
        self.refill(key, policy, token, seen, compute).await
    }

    /// Run `compute` on a detached task and store the result if `key` still
    /// holds `seen`. A delete in between makes the result uncacheable.
    async fn refill<T, E, F, Fut>(
        &self,
        key: &str,
        policy: RefillPolicy,
        token: Vec<u8>,
        seen: Option<Vec<u8>>,
        compute: F,
    ) -> Result<T, RefillError<E>>
    where
        T: Serialize + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let key = key.to_string();

        let task = tokio::spawn(async move {
            let result = compute().await;

            let encoded = match &result {
                Ok(value) => Some(rmp_serde::to_vec(&Slot::Value {
                    value,
                    stored_at_ms: now_millis(),
                })),
                Err(_) => None,
            };

            match encoded {
                Some(Ok(bytes)) => {
                    match store
                        .set_if_unchanged(&key, &bytes, policy.storage_ttl(), seen.as_deref())
                        .await
                    {
                        Ok(true) => metrics::record_refill("ok"),
                        Ok(false) => {
                            metrics::record_refill("discarded");
                            debug!(key = %key, "entry changed during refill, result not stored");
                        }
                        Err(e) => {
                            metrics::record_refill("error");
                            warn!(key = %key, error = %e, "Cache store SET failed");
                        }
                    }
                }
                Some(Err(e)) => {
                    metrics::record_refill("error");
                    warn!(key = %key, error = %e, "Failed to encode cache entry");
                }
                None => {
                    metrics::record_refill("error");
                    debug!(key = %key, "refill failed, nothing stored");
                }
            }

            release_lock(store.as_ref(), &key, &token).await;
            result
        });

        match task.await {
            Ok(result) => result.map_err(RefillError::Compute),
            Err(e) => Err(RefillError::Aborted(e.to_string())),
        }
    }

    /// Poll until another caller's refill lands or the lock frees up.
    async fn wait_for_refill<T: DeserializeOwned>(
        &self,
        key: &str,
        policy: RefillPolicy,
    ) -> Wait<T> {
        let deadline = tokio::time::Instant::now() + self.busy_wait;

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            match self.lookup::<T>(key).await {
                Lookup::Found { value, age } if age <= policy.storage_ttl() => {
                    metrics::record_cache_hit("refilled");
                    return Wait::Ready(value);
                }
                Lookup::Found { .. } | Lookup::Missing => {}
                Lookup::Unavailable => return Wait::GaveUp("store_unavailable"),
            }
            // The holder finished without storing anything usable.
            match self.try_lock(key, policy.stale).await {
                Lock::Acquired(token) => return Wait::Acquired(token),
                Lock::Busy => {}
                Lock::Unavailable => return Wait::GaveUp("lock_unavailable"),
            }
        }

        debug!(key = %key, "refill still running after busy wait");
        Wait::GaveUp("busy_wait_elapsed")
    }

    async fn compute_uncached<T, E, F, Fut>(
        &self,
        key: &str,
        reason: &'static str,
        compute: F,
    ) -> Result<T, RefillError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        debug!(key = %key, reason, "computing without cache");
        metrics::record_degraded(reason);
        compute().await.map_err(RefillError::Compute)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Lookup<T> {
    match rmp_serde::from_slice::<Slot<T>>(bytes) {
        Ok(Slot::Value {
            value,
            stored_at_ms,
        }) => Lookup::Found {
            age: age_since(stored_at_ms),
            value,
        },
        Ok(Slot::Purged { .. }) => {
            debug!(key = %key, "entry purged");
            Lookup::Missing
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to decode cached entry, treating as miss");
            Lookup::Missing
        }
    }
}

async fn release_lock(store: &dyn CacheStore, key: &str, token: &[u8]) {
    let lock_key = CoordinatedCache::lock_key(key);
    if let Err(e) = store.delete_if_equals(&lock_key, token).await {
        warn!(key = %lock_key, error = %e, "Failed to release refill lock");
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn age_since(stored_at_ms: i64) -> Duration {
    let age_ms = now_millis().saturating_sub(stored_at_ms).max(0);
    Duration::from_millis(age_ms as u64)
}
