use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use globalperms_core::{
    GroupMembership, GroupName, MembershipChange, MembershipFilter, MembershipSource,
    SourceError, User, UserId,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

type ShardKey = String;

type ShardTable = HashMap<UserId, Vec<GroupMembership>>;

/// In-memory `user_groups` tables, one per shard.
///
/// Shards can be marked unavailable to simulate a database outage, and every
/// query is counted so callers can assert on cache effectiveness.
#[derive(Debug, Default)]
pub struct InMemoryMembershipStore {
    tables: RwLock<HashMap<ShardKey, ShardTable>>,
    unavailable: RwLock<HashSet<ShardKey>>,
    queries: AtomicU64,
    queries_by_shard: DashMap<ShardKey, u64>,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty shard.
    #[must_use]
    pub fn with_shard(mut self, shard_id: impl Into<String>) -> Self {
        self.tables.get_mut().entry(shard_id.into()).or_default();
        self
    }

    /// Register an empty shard on a shared store. Existing rows are kept.
    pub async fn add_shard(&self, shard_id: impl Into<String>) {
        self.tables.write().await.entry(shard_id.into()).or_default();
    }

    /// Make every query against `shard_id` fail (or succeed again).
    pub async fn set_available(&self, shard_id: &str, available: bool) {
        let mut unavailable = self.unavailable.write().await;
        if available {
            unavailable.remove(shard_id);
        } else {
            unavailable.insert(shard_id.to_string());
        }
    }

    /// Grant `membership` to `user` on `shard_id`.
    ///
    /// An existing row for the same group has its expiry replaced.
    pub async fn add_membership(
        &self,
        shard_id: &str,
        user: &User,
        membership: GroupMembership,
    ) -> Result<MembershipChange, SourceError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(shard_id)
            .ok_or_else(|| SourceError::unknown_shard(shard_id))?;

        let rows = table.entry(user.id()).or_default();
        let old = rows.clone();
        let group = membership.group.clone();
        match rows.iter_mut().find(|row| row.group == group) {
            Some(existing) => existing.expiry = membership.expiry,
            None => rows.push(membership),
        }

        debug!(shard = %shard_id, user = %user.id(), group = %group, "membership added");
        Ok(MembershipChange::new(user.clone())
            .with_added(group)
            .with_memberships(old, rows.clone()))
    }

    /// Revoke `group` from `user` on `shard_id`.
    ///
    /// Returns `None` if the user was not a member.
    pub async fn remove_membership(
        &self,
        shard_id: &str,
        user: &User,
        group: &GroupName,
    ) -> Result<Option<MembershipChange>, SourceError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(shard_id)
            .ok_or_else(|| SourceError::unknown_shard(shard_id))?;

        let Some(rows) = table.get_mut(&user.id()) else {
            return Ok(None);
        };
        let old = rows.clone();
        rows.retain(|row| &row.group != group);
        if rows.len() == old.len() {
            return Ok(None);
        }

        debug!(shard = %shard_id, user = %user.id(), group = %group, "membership removed");
        Ok(Some(
            MembershipChange::new(user.clone())
                .with_removed(group.clone())
                .with_memberships(old, rows.clone()),
        ))
    }

    /// Total queries served, across all shards.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Queries served by one shard.
    pub fn query_count_for(&self, shard_id: &str) -> u64 {
        self.queries_by_shard
            .get(shard_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::SeqCst);
        self.queries_by_shard.clear();
    }
}

#[async_trait]
impl MembershipSource for InMemoryMembershipStore {
    async fn query_groups(
        &self,
        shard_id: &str,
        filter: &MembershipFilter,
    ) -> Result<Vec<GroupName>, SourceError> {
        let tables = self.tables.read().await;
        let table = tables
            .get(shard_id)
            .ok_or_else(|| SourceError::unknown_shard(shard_id))?;

        if self.unavailable.read().await.contains(shard_id) {
            return Err(SourceError::unavailable(shard_id, "shard marked unavailable"));
        }

        self.queries.fetch_add(1, Ordering::SeqCst);
        *self
            .queries_by_shard
            .entry(shard_id.to_string())
            .or_insert(0) += 1;

        let now = OffsetDateTime::now_utc();
        let groups = table
            .get(&filter.user)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.groups.contains(&row.group) && row.is_active_at(now))
                    .map(|row| row.group.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(groups)
    }
}
