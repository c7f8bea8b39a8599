//! Host-facing hooks.
//!
//! - [`CacheInvalidationHook`]: purges cached groups after membership writes
//! - [`PermissionsHook`]: adds resolved groups to a user's effective groups
//!   and classifies bots

mod invalidation;
mod permissions;

pub use invalidation::CacheInvalidationHook;
pub use permissions::PermissionsHook;
