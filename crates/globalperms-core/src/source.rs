//! Membership source abstraction.
//!
//! A membership source answers "which of these groups does this user hold
//! right now" for one shard. Implementations live in `globalperms-db-postgres`
//! and `globalperms-db-memory`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::types::{GroupName, MembershipFilter};

/// Query interface over sharded membership tables.
///
/// # Example
///
/// ```ignore
/// use globalperms_core::{MembershipSource, ShareDescriptor, UserId};
///
/// async fn groups(source: &dyn MembershipSource, share: &ShareDescriptor) {
///     let filter = share.filter_for(UserId::new(42));
///     let groups = source.query_groups(&share.shard_id, &filter).await;
/// }
/// ```
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Returns the groups held by `filter.user` on `shard_id`.
    ///
    /// Only groups listed in `filter.groups` are returned, and only
    /// memberships with no expiry or an expiry at or after the source's own
    /// current time. Reads go to the primary so a fresh write is never missed.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownShard` if the shard is not configured, and
    /// `Unavailable`/`Query` for infrastructure failures. An empty vector
    /// always means "no groups", never "failed".
    async fn query_groups(
        &self,
        shard_id: &str,
        filter: &MembershipFilter,
    ) -> Result<Vec<GroupName>, SourceError>;
}

/// Shareable membership source.
pub type DynMembershipSource = Arc<dyn MembershipSource>;
