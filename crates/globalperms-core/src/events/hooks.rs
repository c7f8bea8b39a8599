//! Hook traits for group membership events.
//!
//! Hooks are capability interfaces: the host keeps a reference and calls
//! them directly, there is no lookup by name.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::PermissionsError;
use crate::types::{GroupName, MembershipChange, User};

/// Error type for hook operations.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Hook execution failed with a message.
    #[error("Hook execution failed: {0}")]
    Execution(String),

    /// Group resolution failed inside the hook.
    #[error(transparent)]
    Permissions(#[from] PermissionsError),

    /// Hook did not finish in time.
    #[error("Hook {0} timed out")]
    Timeout(String),
}

impl HookError {
    /// Create an execution error from a string.
    pub fn execution(msg: impl Into<String>) -> Self {
        HookError::Execution(msg.into())
    }
}

// ============================================================================
// Hook Traits
// ============================================================================

/// Called synchronously after a user's group memberships are committed.
///
/// # Implementation Notes
///
/// - Hooks should be quick; the host waits for them
/// - Errors are logged by the registry and never reach the writer
#[async_trait]
pub trait UserGroupsChangedHook: Send + Sync {
    /// Unique name for this hook (for logging).
    fn name(&self) -> &str;

    /// Handle a committed membership change.
    async fn on_user_groups_changed(&self, change: &MembershipChange) -> Result<(), HookError>;
}

/// Called while the host computes a user's effective groups.
#[async_trait]
pub trait UserEffectiveGroupsHook: Send + Sync {
    /// Unique name for this hook (for logging).
    fn name(&self) -> &str;

    /// Add groups to `groups` for `user`.
    ///
    /// Groups may be added even when an error is returned.
    async fn on_user_effective_groups(
        &self,
        user: &User,
        groups: &mut BTreeSet<GroupName>,
    ) -> Result<(), HookError>;

    /// Decide whether `user` is a bot. Defaults to "no opinion".
    async fn on_user_is_bot(&self, _user: &User) -> Result<bool, HookError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShardFailure;

    #[test]
    fn test_hook_error_display() {
        let err = HookError::execution("something went wrong");
        assert_eq!(err.to_string(), "Hook execution failed: something went wrong");

        let err = HookError::from(PermissionsError::configuration("no shards"));
        assert_eq!(err.to_string(), "Configuration error: no shards");
    }

    #[test]
    fn test_hook_error_keeps_partial_resolution() {
        let err = HookError::from(PermissionsError::PartialResolution {
            failed: vec![ShardFailure {
                shard: "metawiki".into(),
                message: "down".into(),
            }],
        });

        match err {
            HookError::Permissions(inner) => assert!(inner.is_partial()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
