//! Error types for the PostgreSQL membership source.

use globalperms_core::SourceError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for undefined table (42P01).
pub const PG_UNDEFINED_TABLE: &str = "42P01";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Checks if a sqlx error is "undefined table" (42P01).
pub fn is_undefined_table(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNDEFINED_TABLE)
}

/// Checks if a sqlx error means the database could not be reached at all.
pub fn is_connection_error(err: &SqlxError) -> bool {
    matches!(
        err,
        SqlxError::Io(_)
            | SqlxError::Tls(_)
            | SqlxError::PoolTimedOut
            | SqlxError::PoolClosed
            | SqlxError::WorkerCrashed
    )
}

/// Errors specific to the PostgreSQL membership source.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Connection(#[from] sqlx_core::error::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No pool is configured for the shard.
    #[error("Unknown shard: {0}")]
    UnknownShard(String),
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Convert into the error reported for `shard` to the aggregator.
    pub fn into_source_error(self, shard: &str) -> SourceError {
        match self {
            Self::Connection(e) if is_connection_error(&e) => {
                SourceError::unavailable(shard, e.to_string())
            }
            Self::Connection(e) if is_undefined_table(&e) => {
                SourceError::query(shard, format!("user_groups table missing: {e}"))
            }
            Self::UnknownShard(shard) => SourceError::unknown_shard(shard),
            other => SourceError::query(shard, other.to_string()),
        }
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PostgresError::config("invalid URL");
        assert!(err.to_string().contains("Configuration error"));

        let err = PostgresError::UnknownShard("enwiki".into());
        assert!(err.to_string().contains("enwiki"));
    }

    #[test]
    fn test_pool_timeout_is_unavailable() {
        let err = PostgresError::from(SqlxError::PoolTimedOut).into_source_error("metawiki");
        assert!(matches!(err, SourceError::Unavailable { shard, .. } if shard == "metawiki"));
    }

    #[test]
    fn test_other_errors_are_query_failures() {
        let err = PostgresError::from(SqlxError::RowNotFound).into_source_error("metawiki");
        assert!(matches!(err, SourceError::Query { .. }));

        let err = PostgresError::UnknownShard("enwiki".into()).into_source_error("enwiki");
        assert!(matches!(err, SourceError::UnknownShard(_)));
    }
}
