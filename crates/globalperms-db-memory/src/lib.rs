//! In-memory membership source for global permissions.
//!
//! Holds `user_groups` rows per shard in process memory. Used by tests and
//! by single-process setups that have no membership database.
//!
//! # Example
//!
//! ```ignore
//! use globalperms_core::{GroupMembership, User};
//! use globalperms_db_memory::InMemoryMembershipStore;
//!
//! let store = InMemoryMembershipStore::new().with_shard("metawiki");
//! let change = store
//!     .add_membership("metawiki", &User::registered(42, "Alice"), GroupMembership::permanent("sysop"))
//!     .await?;
//! ```

mod store;

pub use store::InMemoryMembershipStore;
