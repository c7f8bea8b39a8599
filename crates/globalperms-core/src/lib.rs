//! Core types for the global permissions system.
//!
//! - [`types`]: user ids, group names, shard descriptors, pinned groups and
//!   membership change events
//! - [`source`]: the [`MembershipSource`] trait implemented by database backends
//! - [`events`]: hook traits the host invokes, plus the [`HookRegistry`]
//! - [`error`]: error types shared by every crate in the workspace

pub mod error;
pub mod events;
pub mod source;
pub mod types;

pub use error::{PermissionsError, Result, ShardFailure, SourceError};
pub use events::{HookError, HookRegistry, UserEffectiveGroupsHook, UserGroupsChangedHook};
pub use source::{DynMembershipSource, MembershipSource};
pub use types::{
    DEFAULT_BOT_MARKER, GroupMembership, GroupName, MembershipChange, MembershipFilter,
    Performer, PinnedGroups, ShareDescriptor, User, UserId,
};
