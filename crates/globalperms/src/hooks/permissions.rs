use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use globalperms_core::{GroupName, HookError, PermissionsError, User, UserEffectiveGroupsHook};
use tracing::debug;

use crate::aggregator::GroupAggregator;

/// Public read API: effective groups and bot classification.
pub struct PermissionsHook {
    aggregator: Arc<GroupAggregator>,
    bot_marker: String,
}

impl PermissionsHook {
    pub fn new(aggregator: Arc<GroupAggregator>, bot_marker: impl Into<String>) -> Self {
        Self {
            aggregator,
            bot_marker: bot_marker.into(),
        }
    }

    /// Add `user`'s global groups to `groups`.
    ///
    /// Anonymous users are left untouched. If some shards fail, the groups
    /// that could be resolved are still added and a `PartialResolution`
    /// error is returned.
    pub async fn effective_groups(
        &self,
        user: &User,
        groups: &mut BTreeSet<GroupName>,
    ) -> Result<(), PermissionsError> {
        if !user.is_registered() {
            return Ok(());
        }

        let resolution = self.aggregator.resolve_groups(user.id()).await;
        groups.extend(resolution.groups);

        if resolution.failures.is_empty() {
            Ok(())
        } else {
            Err(PermissionsError::PartialResolution {
                failed: resolution.failures,
            })
        }
    }

    /// `true` if any of `user`'s global groups contains the bot marker.
    ///
    /// A bot group found on a healthy shard is a definite answer even when
    /// other shards failed; "not a bot" is only reported when every shard
    /// answered.
    pub async fn is_bot(&self, user: &User) -> Result<bool, PermissionsError> {
        if !user.is_registered() {
            return Ok(false);
        }

        let resolution = self.aggregator.resolve_groups(user.id()).await;
        if resolution
            .groups
            .iter()
            .any(|group| group.contains(&self.bot_marker))
        {
            debug!(user = %user.id(), "user is a bot");
            return Ok(true);
        }

        resolution.into_result().map(|_| false)
    }
}

#[async_trait]
impl UserEffectiveGroupsHook for PermissionsHook {
    fn name(&self) -> &str {
        "globalperms-permissions"
    }

    async fn on_user_effective_groups(
        &self,
        user: &User,
        groups: &mut BTreeSet<GroupName>,
    ) -> Result<(), HookError> {
        Ok(self.effective_groups(user, groups).await?)
    }

    async fn on_user_is_bot(&self, user: &User) -> Result<bool, HookError> {
        Ok(self.is_bot(user).await?)
    }
}
