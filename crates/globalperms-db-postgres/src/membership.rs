//! `user_groups` queries against shard databases.

use std::collections::HashMap;

use async_trait::async_trait;
use globalperms_core::{
    GroupMembership, GroupName, MembershipChange, MembershipFilter, MembershipSource,
    SourceError, User, UserId,
};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgConnection, PgPool};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::config::ShardDatabases;
use crate::error::{PostgresError, Result};
use crate::{migrations, pool};

/// Membership source backed by one PostgreSQL pool per shard.
///
/// Expiry is compared against the database's own `now()`, so clock skew on
/// the application hosts does not matter.
#[derive(Debug, Clone)]
pub struct PostgresMembershipSource {
    pools: HashMap<String, PgPool>,
}

impl PostgresMembershipSource {
    /// Wrap existing pools, keyed by shard id.
    pub fn from_pools<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = (S, PgPool)>,
        S: Into<String>,
    {
        Self {
            pools: pools.into_iter().map(|(id, pool)| (id.into(), pool)).collect(),
        }
    }

    /// Build a lazy pool for every configured shard, running migrations
    /// where enabled.
    ///
    /// An unreachable shard does not fail startup: its migrations are
    /// skipped and its queries report the outage.
    ///
    /// # Errors
    ///
    /// Fails on a malformed database URL or a migration that the database
    /// rejects.
    pub async fn connect(shards: &ShardDatabases) -> Result<Self> {
        let mut pools = HashMap::with_capacity(shards.len());

        for (shard_id, config) in shards {
            let pool = pool::shard_pool(shard_id, config)?;
            if config.run_migrations {
                match migrations::run(&pool).await {
                    Ok(()) => {}
                    Err(PostgresError::Connection(e)) => {
                        warn!(shard = %shard_id, error = %e, "Shard unreachable, migrations skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
            info!(shard = %shard_id, "Shard database configured");
            pools.insert(shard_id.clone(), pool);
        }

        Ok(Self { pools })
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    fn pool(&self, shard_id: &str) -> Result<&PgPool> {
        self.pools
            .get(shard_id)
            .ok_or_else(|| PostgresError::UnknownShard(shard_id.to_string()))
    }

    /// Grant `membership` to `user` on `shard_id`.
    ///
    /// An existing row for the same group has its expiry replaced.
    #[instrument(skip(self, user, membership), fields(shard = %shard_id, user = %user.id(), group = %membership.group))]
    pub async fn add_membership(
        &self,
        shard_id: &str,
        user: &User,
        membership: GroupMembership,
    ) -> Result<MembershipChange> {
        let mut tx = self.pool(shard_id)?.begin().await?;

        let old = fetch_memberships(&mut tx, user.id()).await?;
        query(
            r#"
            INSERT INTO user_groups (ug_user, ug_group, ug_expiry)
            VALUES ($1, $2, $3)
            ON CONFLICT (ug_user, ug_group) DO UPDATE SET ug_expiry = EXCLUDED.ug_expiry
            "#,
        )
        .bind(user.id().get())
        .bind(membership.group.as_str())
        .bind(membership.expiry)
        .execute(&mut *tx)
        .await?;
        let new = fetch_memberships(&mut tx, user.id()).await?;

        tx.commit().await?;
        debug!("membership added");

        Ok(MembershipChange::new(user.clone())
            .with_added(membership.group)
            .with_memberships(old, new))
    }

    /// Revoke `group` from `user` on `shard_id`.
    ///
    /// Returns `None` if the user was not a member.
    #[instrument(skip(self, user), fields(shard = %shard_id, user = %user.id()))]
    pub async fn remove_membership(
        &self,
        shard_id: &str,
        user: &User,
        group: &GroupName,
    ) -> Result<Option<MembershipChange>> {
        let mut tx = self.pool(shard_id)?.begin().await?;

        let old = fetch_memberships(&mut tx, user.id()).await?;
        let deleted = query("DELETE FROM user_groups WHERE ug_user = $1 AND ug_group = $2")
            .bind(user.id().get())
            .bind(group.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let new = fetch_memberships(&mut tx, user.id()).await?;
        tx.commit().await?;
        debug!(group = %group, "membership removed");

        Ok(Some(
            MembershipChange::new(user.clone())
                .with_removed(group.clone())
                .with_memberships(old, new),
        ))
    }
}

async fn fetch_memberships(conn: &mut PgConnection, user: UserId) -> Result<Vec<GroupMembership>> {
    let rows: Vec<(String, Option<OffsetDateTime>)> = query_as(
        r#"
        SELECT ug_group, ug_expiry
        FROM user_groups
        WHERE ug_user = $1
        ORDER BY ug_group
        "#,
    )
    .bind(user.get())
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(group, expiry)| GroupMembership {
            group: GroupName::new(group),
            expiry,
        })
        .collect())
}

#[async_trait]
impl MembershipSource for PostgresMembershipSource {
    #[instrument(skip(self, filter), fields(shard = %shard_id, user = %filter.user))]
    async fn query_groups(
        &self,
        shard_id: &str,
        filter: &MembershipFilter,
    ) -> std::result::Result<Vec<GroupName>, SourceError> {
        if filter.groups.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self
            .pool(shard_id)
            .map_err(|e| e.into_source_error(shard_id))?;
        let groups: Vec<String> = filter.groups.iter().map(|g| g.as_str().to_string()).collect();

        let rows: Vec<(String,)> = query_as(
            r#"
            SELECT ug_group
            FROM user_groups
            WHERE ug_user = $1
              AND ug_group = ANY($2)
              AND (ug_expiry IS NULL OR ug_expiry >= now())
            "#,
        )
        .bind(filter.user.get())
        .bind(groups)
        .fetch_all(pool)
        .await
        .map_err(|e| PostgresError::from(e).into_source_error(shard_id))?;

        debug!(count = rows.len(), "shard groups fetched");
        Ok(rows.into_iter().map(|(group,)| GroupName::new(group)).collect())
    }
}
