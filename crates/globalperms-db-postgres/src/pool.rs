//! Shard connection pools.
//!
//! Pools connect lazily: building one never touches the network. A shard
//! that is down at startup fails its own queries with
//! [`SourceError::Unavailable`](globalperms_core::SourceError) and leaves the
//! other shards alone.

use std::time::Duration;

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgConnectOptions, PgPool, Postgres};
use tracing::{debug, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result};

/// Connections are recycled after this long unless configured otherwise.
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Build the pool for `shard_id` without connecting.
///
/// Must be called from within a Tokio runtime; the pool spawns its idle
/// reaper immediately.
///
/// # Errors
///
/// Returns [`PostgresError::Config`] if the URL is empty or cannot be parsed.
#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub fn shard_pool(shard_id: &str, config: &PostgresConfig) -> Result<PgPool> {
    if config.url.trim().is_empty() {
        return Err(PostgresError::config(format!(
            "shard '{shard_id}' has an empty database URL"
        )));
    }

    let connect_options: PgConnectOptions = config.url.parse().map_err(|e| {
        PostgresError::config(format!("shard '{shard_id}' has an invalid database URL: {e}"))
    })?;

    let max_connections = config.pool_size.max(1);
    let mut options = PoolOptions::<Postgres>::new()
        .max_connections(max_connections)
        .min_connections(config.min_connections.unwrap_or(0).min(max_connections))
        .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
        .max_lifetime(
            config
                .max_lifetime_secs
                .map_or(DEFAULT_MAX_LIFETIME, Duration::from_secs),
        )
        .test_before_acquire(false);

    if let Some(idle_timeout) = config.idle_timeout_ms {
        options = options.idle_timeout(Duration::from_millis(idle_timeout));
    }

    debug!(max_connections, "shard pool created (lazy)");
    Ok(options.connect_lazy_with(connect_options))
}

/// Masks the password in a database URL for logging.
pub(crate) fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
    {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if colon_pos > scheme_end {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
