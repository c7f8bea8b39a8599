//! PostgreSQL membership source for global permissions.
//!
//! Each shard is a separate database holding a `user_groups` table. The
//! source keeps one connection pool per shard and answers
//! [`MembershipSource::query_groups`](globalperms_core::MembershipSource)
//! with active memberships only.

pub mod config;
pub mod error;
pub mod membership;
pub mod migrations;
pub mod pool;

pub use config::{PostgresConfig, ShardDatabases};
pub use error::{PostgresError, Result};
pub use membership::PostgresMembershipSource;
pub use pool::shard_pool;

/// Type alias for the PostgreSQL pool.
pub type PgPool = sqlx_postgres::PgPool;
