//! Hook system the host uses to call into global permissions.
//!
//! The host holds a [`HookRegistry`] and invokes it at two points:
//!
//! - after a user's group memberships are committed
//!   ([`HookRegistry::dispatch_user_groups_changed`])
//! - while resolving a user's effective groups or bot status
//!   ([`HookRegistry::run_effective_groups`], [`HookRegistry::run_is_bot`])
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use globalperms_core::events::HookRegistry;
//!
//! let registry = HookRegistry::new();
//! registry.register_groups_changed(Arc::new(invalidation_hook)).await;
//! registry.register_effective_groups(Arc::new(permissions_hook)).await;
//!
//! registry.dispatch_user_groups_changed(&change).await;
//! ```

mod hooks;
mod registry;

pub use hooks::{HookError, UserEffectiveGroupsHook, UserGroupsChangedHook};
pub use registry::HookRegistry;
