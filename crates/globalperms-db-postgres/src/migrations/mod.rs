//! Embedded schema migrations for shard databases.

use sqlx_core::migrate::{MigrateError, Migration, MigrationType};
use sqlx_postgres::PgPool;
use std::borrow::Cow;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result, is_connection_error};

/// Migrations compiled into the binary, oldest first.
/// Each entry is (version, description, sql).
macro_rules! embedded_migrations {
    () => {
        &[(
            20260301000001i64,
            "user_groups",
            include_str!("../../migrations/20260301000001_user_groups.sql"),
        )]
    };
}

fn build_migrations() -> Vec<Migration> {
    embedded_migrations!()
        .iter()
        .map(|(version, description, sql)| Migration {
            version: *version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect()
}

/// Runs all pending migrations against one shard database.
///
/// Applied versions are tracked in `_sqlx_migrations`, so running this on
/// every startup is safe.
///
/// # Errors
///
/// Returns [`PostgresError::Connection`] if the database cannot be reached
/// and [`PostgresError::Migration`] if a migration fails to execute.
#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> Result<()> {
    let migrations = build_migrations();
    info!(count = migrations.len(), "Running database migrations (embedded)");

    let migrator = sqlx_core::migrate::Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    };

    migrator.run(pool).await.map_err(|e| match e {
        MigrateError::Execute(e) if is_connection_error(&e) => PostgresError::Connection(e),
        other => PostgresError::Migration(format!("Migration failed: {other}")),
    })?;

    info!("Database migrations completed successfully");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        let migrations = build_migrations();
        assert!(!migrations.is_empty());
        assert!(
            migrations
                .windows(2)
                .all(|pair| pair[0].version < pair[1].version)
        );
        assert!(migrations[0].sql.contains("user_groups"));
    }
}
