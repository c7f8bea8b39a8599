use std::sync::Arc;

use async_trait::async_trait;
use globalperms_core::{HookError, MembershipChange, UserGroupsChangedHook};
use tracing::{debug, warn};

use crate::aggregator::{GroupAggregator, cache_key};
use crate::metrics;

/// Purges the local shard's cached groups for a user whose memberships changed.
///
/// Other shards' entries are left alone: their data did not change. Failures
/// are logged and swallowed; the fresh TTL bounds how long stale groups can
/// be served.
pub struct CacheInvalidationHook {
    aggregator: Arc<GroupAggregator>,
    local_shard: String,
}

impl CacheInvalidationHook {
    pub fn new(aggregator: Arc<GroupAggregator>, local_shard: impl Into<String>) -> Self {
        Self {
            aggregator,
            local_shard: local_shard.into(),
        }
    }

    pub fn local_shard(&self) -> &str {
        &self.local_shard
    }

    /// Delete the cached entry for the changed user on the local shard.
    pub async fn on_membership_changed(&self, change: &MembershipChange) {
        let user = change.user_id();
        if user.is_anonymous() {
            debug!(user = %user, "ignoring membership change for anonymous user");
            return;
        }

        match self.aggregator.invalidate(&self.local_shard, user).await {
            Ok(()) => {
                metrics::record_invalidation("ok");
                debug!(
                    key = %cache_key(&self.local_shard, user),
                    added = ?change.added,
                    removed = ?change.removed,
                    "cached groups invalidated"
                );
            }
            Err(e) => {
                metrics::record_invalidation("error");
                warn!(
                    key = %cache_key(&self.local_shard, user),
                    error = %e,
                    "Failed to invalidate cached groups"
                );
            }
        }
    }
}

#[async_trait]
impl UserGroupsChangedHook for CacheInvalidationHook {
    fn name(&self) -> &str {
        "globalperms-invalidation"
    }

    async fn on_user_groups_changed(&self, change: &MembershipChange) -> Result<(), HookError> {
        self.on_membership_changed(change).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use globalperms_cache::{CacheError, CacheStore, CoordinatedCache, RefillPolicy};
    use globalperms_core::{PinnedGroups, ShareDescriptor, User};
    use globalperms_db_memory::InMemoryMembershipStore;
    use std::time::Duration;

    struct DownStore;

    #[async_trait]
    impl CacheStore for DownStore {
        async fn get(&self, _key: &str) -> globalperms_cache::Result<Option<Vec<u8>>> {
            Err(CacheError::Pool("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> globalperms_cache::Result<()> {
            Err(CacheError::Pool("connection refused".into()))
        }
        async fn add(&self, _key: &str, _value: &[u8], _ttl: Duration) -> globalperms_cache::Result<bool> {
            Err(CacheError::Pool("connection refused".into()))
        }
        async fn set_if_unchanged(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Duration,
            _expected: Option<&[u8]>,
        ) -> globalperms_cache::Result<bool> {
            Err(CacheError::Pool("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> globalperms_cache::Result<()> {
            Err(CacheError::Pool("connection refused".into()))
        }
        async fn delete_if_equals(&self, _key: &str, _expected: &[u8]) -> globalperms_cache::Result<bool> {
            Err(CacheError::Pool("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_is_swallowed() {
        let aggregator = Arc::new(GroupAggregator::new(
            vec![ShareDescriptor::new("metawiki", ["sysop"])],
            PinnedGroups::new(),
            Arc::new(InMemoryMembershipStore::new().with_shard("metawiki")),
            CoordinatedCache::new(Arc::new(DownStore)),
            RefillPolicy::default(),
        ));
        let hook = CacheInvalidationHook::new(aggregator, "metawiki");

        let change = MembershipChange::new(User::registered(42, "Alice")).with_added("sysop");
        hook.on_user_groups_changed(&change)
            .await
            .expect("never propagates");
    }
}
