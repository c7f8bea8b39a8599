//! Error types for the shared cache.

/// Errors from the cache storage layer.
///
/// These never reach permission checks directly: the coordinated cache
/// degrades to direct computation when storage misbehaves.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Could not get a connection from the pool.
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// Entry could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid cache configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Error returned by [`crate::CoordinatedCache::get_or_compute`].
#[derive(Debug, thiserror::Error)]
pub enum RefillError<E> {
    /// The compute function failed. Only the caller that ran it sees this.
    #[error(transparent)]
    Compute(E),

    /// The refill task panicked or was cancelled by the runtime.
    #[error("Refill task aborted: {0}")]
    Aborted(String),
}

impl<E> RefillError<E> {
    /// Returns the compute error, if that is what this is.
    pub fn into_compute(self) -> Option<E> {
        match self {
            Self::Compute(e) => Some(e),
            Self::Aborted(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
