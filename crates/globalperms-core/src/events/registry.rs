//! Hook registry and dispatcher.
//!
//! Hooks run inline, one after another, in registration order. Each call is
//! wrapped with a timeout and panic recovery so one broken hook cannot take
//! down the host's request.

use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::hooks::{HookError, UserEffectiveGroupsHook, UserGroupsChangedHook};
use crate::types::{GroupName, MembershipChange, User};

/// Default timeout for hook execution.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Hook Registry
// ============================================================================

/// Registry for membership hooks.
pub struct HookRegistry {
    groups_changed: RwLock<Vec<Arc<dyn UserGroupsChangedHook>>>,
    effective_groups: RwLock<Vec<Arc<dyn UserEffectiveGroupsHook>>>,
    timeout: Duration,
}

impl HookRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    /// Create a new registry with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            groups_changed: RwLock::new(Vec::new()),
            effective_groups: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Register a membership-change hook.
    pub async fn register_groups_changed(&self, hook: Arc<dyn UserGroupsChangedHook>) {
        let name = hook.name().to_string();
        self.groups_changed.write().await.push(hook);
        debug!(hook = %name, "Registered groups-changed hook");
    }

    /// Register an effective-groups hook.
    pub async fn register_effective_groups(&self, hook: Arc<dyn UserEffectiveGroupsHook>) {
        let name = hook.name().to_string();
        self.effective_groups.write().await.push(hook);
        debug!(hook = %name, "Registered effective-groups hook");
    }

    /// Get the number of registered hooks.
    pub async fn hook_count(&self) -> usize {
        self.groups_changed.read().await.len() + self.effective_groups.read().await.len()
    }

    /// Notify every membership-change hook.
    ///
    /// Errors, panics and timeouts are logged and swallowed: the write has
    /// already been committed and must not be reported as failed.
    pub async fn dispatch_user_groups_changed(&self, change: &MembershipChange) {
        let hooks = self.groups_changed.read().await.clone();

        if hooks.is_empty() {
            debug!(user = %change.user_id(), "No groups-changed hooks registered");
            return;
        }

        for hook in hooks {
            let hook_name = hook.name().to_string();
            match self
                .guarded(&hook_name, hook.on_user_groups_changed(change))
                .await
            {
                Ok(()) => debug!(hook = %hook_name, "Hook executed successfully"),
                Err(e) => warn!(
                    hook = %hook_name,
                    user = %change.user_id(),
                    error = %e,
                    "Hook execution failed"
                ),
            }
        }
    }

    /// Run every effective-groups hook against `groups`.
    ///
    /// All hooks run even if one fails, so groups contributed by healthy
    /// hooks are kept. The first error is returned.
    pub async fn run_effective_groups(
        &self,
        user: &User,
        groups: &mut BTreeSet<GroupName>,
    ) -> Result<(), HookError> {
        let hooks = self.effective_groups.read().await.clone();
        let mut first_error = None;

        for hook in hooks {
            let hook_name = hook.name().to_string();
            let result = self
                .guarded(&hook_name, hook.on_user_effective_groups(user, groups))
                .await;
            if let Err(e) = result {
                warn!(hook = %hook_name, user = %user.id(), error = %e, "Effective groups hook failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Ask every effective-groups hook whether `user` is a bot.
    ///
    /// Stops at the first hook that answers `true`.
    pub async fn run_is_bot(&self, user: &User) -> Result<bool, HookError> {
        let hooks = self.effective_groups.read().await.clone();
        let mut first_error = None;

        for hook in hooks {
            let hook_name = hook.name().to_string();
            match self.guarded(&hook_name, hook.on_user_is_bot(user)).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!(hook = %hook_name, user = %user.id(), error = %e, "Bot classification hook failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(false), Err)
    }

    async fn guarded<T, F>(&self, hook_name: &str, fut: F) -> Result<T, HookError>
    where
        F: Future<Output = Result<T, HookError>>,
    {
        match tokio::time::timeout(self.timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let panic_msg = panic_message(panic.as_ref());
                error!(hook = %hook_name, panic = %panic_msg, "Hook panicked!");
                Err(HookError::execution(format!("hook panicked: {panic_msg}")))
            }
            Err(_) => {
                error!(
                    hook = %hook_name,
                    timeout_secs = self.timeout.as_secs(),
                    "Hook timed out"
                );
                Err(HookError::Timeout(hook_name.to_string()))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
