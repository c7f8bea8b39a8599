//! Global group permissions.
//!
//! A user's global groups are read from several shard databases, each
//! authoritative for a fixed set of groups, merged with statically pinned
//! groups, and cached per shard in a store shared by every node.
//!
//! - [`aggregator`]: per-shard cached lookups merged into one sorted list
//! - [`hooks`]: cache invalidation after membership writes, and the
//!   effective-groups / bot read API
//! - [`bootstrap`]: [`GlobalPermissions`], built from explicit dependencies
//!   or from [`config::AppConfig`]

pub mod aggregator;
pub mod bootstrap;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod observability;

pub use aggregator::{CACHE_KEY_PREFIX, GroupAggregator, GroupResolution, cache_key};
pub use bootstrap::{GlobalPermissions, GlobalPermissionsBuilder, StartupError};
pub use config::{AppConfig, ConfigError, PermissionsConfig, PinnedConfig, ShardConfig, SourceKind};
pub use hooks::{CacheInvalidationHook, PermissionsHook};
