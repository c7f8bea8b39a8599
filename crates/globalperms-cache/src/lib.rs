//! Shared cache for global permissions.
//!
//! [`CoordinatedCache`] sits on top of a [`CacheStore`] and provides
//! get-or-compute with stale reads and at most one concurrent refill per key
//! across every node sharing the store.

pub mod backend;
pub mod config;
pub mod coordinated;
pub mod error;
pub mod metrics;

use std::time::Duration;

pub use backend::{CacheBackend, CacheStats, CacheStore, CachedEntry};
pub use config::{CacheConfig, RedisConfig};
pub use coordinated::{CoordinatedCache, DEFAULT_FRESH_TTL, DEFAULT_STALE_TTL, RefillPolicy};
pub use error::{CacheError, RefillError, Result};

/// Create the cache backend described by `config`.
///
/// With Redis disabled the backend is process-local. With Redis enabled the
/// backend is always Redis, even if the server cannot be reached yet: calls
/// degrade to direct computation until it comes back.
///
/// # Errors
///
/// Returns `CacheError::Configuration` if the Redis pool cannot be built
/// (for example, a malformed URL).
pub async fn create_cache_backend(config: &RedisConfig) -> Result<CacheBackend> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache store");
        return Ok(CacheBackend::new_local());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Duration::from_millis(config.timeout_ms);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| CacheError::Configuration(format!("failed to create Redis pool: {e}")))?;

    match pool.get().await {
        Ok(_) => tracing::info!("Connected to Redis"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis unreachable at startup; lookups will bypass the cache until it recovers"
        ),
    }

    Ok(CacheBackend::new_redis(pool))
}
