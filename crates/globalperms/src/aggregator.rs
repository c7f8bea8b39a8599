//! Group aggregation across shards.
//!
//! Each shard's answer for a user is cached under its own key, so a
//! membership change on one shard only invalidates that shard's entry.
//! Pinned groups are applied on every call and never cached.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::join_all;
use globalperms_cache::{CacheError, CoordinatedCache, RefillError, RefillPolicy};
use globalperms_core::{
    DynMembershipSource, GroupName, PermissionsError, PinnedGroups, ShardFailure,
    ShareDescriptor, SourceError, User, UserId,
};
use tracing::{debug, warn};

use crate::metrics;

/// Namespace shared by every tenant reading the same shards.
pub const CACHE_KEY_PREFIX: &str = "global:globalpermissions";

/// Cache key holding `user`'s groups on `shard_id`.
pub fn cache_key(shard_id: &str, user: UserId) -> String {
    format!("{CACHE_KEY_PREFIX}:{shard_id}:{user}")
}

/// Outcome of resolving a user's groups.
///
/// `groups` is sorted and deduplicated and contains pinned groups plus
/// everything healthy shards returned. `failures` lists shards that could
/// not be read; an empty list means the answer is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupResolution {
    pub groups: Vec<GroupName>,
    pub failures: Vec<ShardFailure>,
}

impl GroupResolution {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.as_str() == group)
    }

    /// The groups if every shard answered, otherwise a `PartialResolution` error.
    pub fn into_result(self) -> Result<Vec<GroupName>, PermissionsError> {
        if self.failures.is_empty() {
            Ok(self.groups)
        } else {
            Err(PermissionsError::PartialResolution {
                failed: self.failures,
            })
        }
    }
}

/// Resolves a user's groups from every configured shard.
pub struct GroupAggregator {
    shards: Vec<ShareDescriptor>,
    pinned: PinnedGroups,
    source: DynMembershipSource,
    cache: CoordinatedCache,
    policy: RefillPolicy,
}

impl GroupAggregator {
    pub fn new(
        shards: Vec<ShareDescriptor>,
        pinned: PinnedGroups,
        source: DynMembershipSource,
        cache: CoordinatedCache,
        policy: RefillPolicy,
    ) -> Self {
        Self {
            shards,
            pinned,
            source,
            cache,
            policy,
        }
    }

    pub fn shards(&self) -> &[ShareDescriptor] {
        &self.shards
    }

    /// Sorted, deduplicated groups of `user` across all shards plus pinned groups.
    ///
    /// Shards are queried concurrently. A failing shard is reported in the
    /// resolution and does not hide the other shards' groups.
    pub async fn resolve_groups(&self, user: UserId) -> GroupResolution {
        let lookups = self
            .shards
            .iter()
            .map(|shard| async move { (shard, self.shard_groups(shard, user).await) });

        let mut groups = BTreeSet::new();
        let mut failures = Vec::new();

        for (shard, result) in join_all(lookups).await {
            match result {
                Ok(shard_groups) => groups.extend(shard_groups),
                Err(e) => {
                    warn!(shard = %shard.shard_id, user = %user, error = %e, "Shard lookup failed");
                    metrics::record_shard_failure(&shard.shard_id);
                    failures.push(ShardFailure {
                        shard: shard.shard_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        groups.extend(self.pinned.groups_for(user).cloned());

        debug!(user = %user, groups = groups.len(), failed = failures.len(), "groups resolved");
        GroupResolution {
            groups: groups.into_iter().collect(),
            failures,
        }
    }

    pub async fn groups_for_user_id(&self, id: i64) -> GroupResolution {
        self.resolve_groups(UserId::new(id)).await
    }

    /// Groups of `user`. Anonymous users have none and cause no lookups.
    pub async fn groups_for_user(&self, user: &User) -> GroupResolution {
        if !user.is_registered() {
            return GroupResolution::default();
        }
        self.resolve_groups(user.id()).await
    }

    /// Drop the cached groups of `user` on `shard_id`.
    pub async fn invalidate(&self, shard_id: &str, user: UserId) -> Result<(), CacheError> {
        self.cache.delete(&cache_key(shard_id, user)).await
    }

    /// Drop the cached groups of `user` on every shard.
    pub async fn invalidate_all(&self, user: UserId) -> Result<(), CacheError> {
        for shard in &self.shards {
            self.invalidate(&shard.shard_id, user).await?;
        }
        Ok(())
    }

    async fn shard_groups(
        &self,
        shard: &ShareDescriptor,
        user: UserId,
    ) -> Result<Vec<GroupName>, SourceError> {
        let source = Arc::clone(&self.source);
        let shard_id = shard.shard_id.clone();
        let filter = shard.filter_for(user);

        let cached = self
            .cache
            .get_or_compute(&cache_key(&shard.shard_id, user), self.policy, move || async move {
                source.query_groups(&shard_id, &filter).await
            })
            .await;

        let groups: Vec<GroupName> = match cached {
            Ok(groups) => groups,
            Err(RefillError::Compute(e)) => return Err(e),
            Err(RefillError::Aborted(message)) => {
                return Err(SourceError::query(&shard.shard_id, message));
            }
        };

        // Entries cached under a wider allow list must not leak through.
        Ok(groups.into_iter().filter(|g| shard.allows(g)).collect())
    }
}

impl std::fmt::Debug for GroupAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupAggregator")
            .field("shards", &self.shards)
            .field("pinned", &self.pinned)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use globalperms_cache::CacheBackend;
    use globalperms_core::{GroupMembership, MembershipFilter, MembershipSource};
    use globalperms_db_memory::InMemoryMembershipStore;
    use std::time::Duration;

    fn aggregator(store: Arc<InMemoryMembershipStore>, pinned: PinnedGroups) -> GroupAggregator {
        GroupAggregator::new(
            vec![
                ShareDescriptor::new("metawiki", ["sysop", "bot"]),
                ShareDescriptor::new("commonswiki", ["translator"]),
            ],
            pinned,
            store,
            CoordinatedCache::new(Arc::new(CacheBackend::new_local())),
            RefillPolicy::default(),
        )
    }

    async fn store() -> Arc<InMemoryMembershipStore> {
        let store = Arc::new(
            InMemoryMembershipStore::new()
                .with_shard("metawiki")
                .with_shard("commonswiki"),
        );
        let alice = User::registered(42, "Alice");
        store
            .add_membership("metawiki", &alice, GroupMembership::permanent("sysop"))
            .await
            .expect("add");
        store
            .add_membership("commonswiki", &alice, GroupMembership::permanent("translator"))
            .await
            .expect("add");
        store
    }

    fn names(groups: &[GroupName]) -> Vec<&str> {
        groups.iter().map(GroupName::as_str).collect()
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(
            cache_key("metawiki", UserId::new(42)),
            "global:globalpermissions:metawiki:42"
        );
    }

    #[tokio::test]
    async fn test_merges_shards_and_pinned_groups() {
        let aggregator = aggregator(store().await, PinnedGroups::new().with("steward", &[42]));

        let resolution = aggregator.resolve_groups(UserId::new(42)).await;

        assert!(resolution.is_complete());
        assert_eq!(names(&resolution.groups), vec!["steward", "sysop", "translator"]);
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let store = store().await;
        let aggregator = aggregator(Arc::clone(&store), PinnedGroups::new());

        let first = aggregator.resolve_groups(UserId::new(42)).await;
        let queries = store.query_count();
        let second = aggregator.resolve_groups(UserId::new(42)).await;

        assert_eq!(first, second);
        assert_eq!(queries, 2);
        assert_eq!(store.query_count(), queries);
    }

    #[tokio::test]
    async fn test_pinned_groups_survive_total_outage() {
        let store = store().await;
        store.set_available("metawiki", false).await;
        store.set_available("commonswiki", false).await;
        let aggregator = aggregator(store, PinnedGroups::new().with("steward", &[42]));

        let resolution = aggregator.resolve_groups(UserId::new(42)).await;

        assert_eq!(names(&resolution.groups), vec!["steward"]);
        assert_eq!(resolution.failures.len(), 2);
        let err = resolution.into_result().expect_err("partial");
        assert!(err.is_partial());
        assert_eq!(err.failed_shards(), vec!["metawiki", "commonswiki"]);
    }

    #[tokio::test]
    async fn test_one_failing_shard_keeps_the_others() {
        let store = store().await;
        store.set_available("commonswiki", false).await;
        let aggregator = aggregator(store, PinnedGroups::new());

        let resolution = aggregator.resolve_groups(UserId::new(42)).await;

        assert_eq!(names(&resolution.groups), vec!["sysop"]);
        assert_eq!(resolution.failures[0].shard, "commonswiki");
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let store = store().await;
        store.set_available("metawiki", false).await;
        let aggregator = aggregator(Arc::clone(&store), PinnedGroups::new());

        assert!(!aggregator.resolve_groups(UserId::new(42)).await.is_complete());

        store.set_available("metawiki", true).await;
        let resolution = aggregator.resolve_groups(UserId::new(42)).await;
        assert!(resolution.is_complete());
        assert_eq!(names(&resolution.groups), vec!["sysop", "translator"]);
    }

    #[tokio::test]
    async fn test_stale_refill_failure_reports_shard() {
        let store = store().await;
        let aggregator = GroupAggregator::new(
            vec![ShareDescriptor::new("metawiki", ["sysop"])],
            PinnedGroups::new(),
            Arc::clone(&store) as DynMembershipSource,
            CoordinatedCache::new(Arc::new(CacheBackend::new_local())),
            RefillPolicy::new(Duration::from_millis(20), Duration::from_secs(60)),
        );
        assert!(aggregator.resolve_groups(UserId::new(42)).await.is_complete());

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.set_available("metawiki", false).await;

        // The refilling caller gets the failure, not the stale entry.
        let resolution = aggregator.resolve_groups(UserId::new(42)).await;
        assert!(resolution.groups.is_empty());
        assert_eq!(resolution.failures[0].shard, "metawiki");

        // The lock was released, so the next caller retries.
        store.set_available("metawiki", true).await;
        let resolution = aggregator.resolve_groups(UserId::new(42)).await;
        assert!(resolution.is_complete());
        assert_eq!(names(&resolution.groups), vec!["sysop"]);
        assert_eq!(store.query_count_for("metawiki"), 2);
    }

    /// Source that ignores the filter and returns everything it has.
    struct LeakySource;

    #[async_trait]
    impl MembershipSource for LeakySource {
        async fn query_groups(
            &self,
            _shard_id: &str,
            _filter: &MembershipFilter,
        ) -> Result<Vec<GroupName>, SourceError> {
            Ok(vec!["sysop".into(), "oversight".into(), "translator".into()])
        }
    }

    #[tokio::test]
    async fn test_shard_never_contributes_outside_whitelist() {
        let aggregator = GroupAggregator::new(
            vec![ShareDescriptor::new("metawiki", ["sysop"])],
            PinnedGroups::new(),
            Arc::new(LeakySource),
            CoordinatedCache::new(Arc::new(CacheBackend::new_local())),
            RefillPolicy::default(),
        );

        let resolution = aggregator.resolve_groups(UserId::new(42)).await;
        assert_eq!(names(&resolution.groups), vec!["sysop"]);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent_and_scoped() {
        let store = store().await;
        let aggregator = aggregator(Arc::clone(&store), PinnedGroups::new());
        aggregator.resolve_groups(UserId::new(42)).await;
        store.reset_query_count();

        aggregator.invalidate("metawiki", UserId::new(42)).await.expect("invalidate");
        aggregator.invalidate("metawiki", UserId::new(42)).await.expect("invalidate again");
        aggregator.resolve_groups(UserId::new(42)).await;

        assert_eq!(store.query_count_for("metawiki"), 1);
        assert_eq!(store.query_count_for("commonswiki"), 0);
    }

    #[tokio::test]
    async fn test_anonymous_user_has_no_groups() {
        let store = store().await;
        let aggregator = aggregator(Arc::clone(&store), PinnedGroups::new());

        let resolution = aggregator.groups_for_user(&User::anonymous("127.0.0.1")).await;

        assert!(resolution.groups.is_empty());
        assert_eq!(store.query_count(), 0);
    }
}
