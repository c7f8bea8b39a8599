//! Cache and Redis configuration sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinated::{DEFAULT_FRESH_TTL, DEFAULT_STALE_TTL, RefillPolicy};

/// Redis configuration for multi-node deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis as the shared cache store.
    /// Default: false (local store, single-instance deployments only)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    500
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// Freshness and wait settings for cached group lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds a cached group list is served without refresh.
    #[serde(default = "default_fresh_ttl_secs")]
    pub fresh_ttl_secs: u64,

    /// Seconds past the fresh window a stale list may still be served.
    #[serde(default = "default_stale_ttl_secs")]
    pub stale_ttl_secs: u64,

    /// How long a caller with nothing cached waits for another caller's refill.
    #[serde(default = "default_busy_wait_ms")]
    pub busy_wait_ms: u64,

    /// Poll interval while waiting.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_fresh_ttl_secs() -> u64 {
    DEFAULT_FRESH_TTL.as_secs()
}

fn default_stale_ttl_secs() -> u64 {
    DEFAULT_STALE_TTL.as_secs()
}

fn default_busy_wait_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_secs: default_fresh_ttl_secs(),
            stale_ttl_secs: default_stale_ttl_secs(),
            busy_wait_ms: default_busy_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> RefillPolicy {
        RefillPolicy::new(
            Duration::from_secs(self.fresh_ttl_secs),
            Duration::from_secs(self.stale_ttl_secs),
        )
    }

    pub fn busy_wait(&self) -> Duration {
        Duration::from_millis(self.busy_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.fresh_ttl_secs == 0 {
            return Err("cache.fresh_ttl_secs must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("cache.poll_interval_ms must be greater than 0".into());
        }
        Ok(())
    }
}
