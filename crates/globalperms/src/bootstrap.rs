//! Wiring of the permission components.
//!
//! Nothing here is global: a [`GlobalPermissions`] owns its aggregator and
//! hooks, and the host decides where to keep it.

use std::collections::BTreeSet;
use std::sync::Arc;

use globalperms_cache::{
    CacheBackend, CacheConfig, CacheError, CacheStats, CacheStore, CoordinatedCache,
    create_cache_backend,
};
use globalperms_core::{
    DynMembershipSource, GroupName, HookRegistry, MembershipChange, PermissionsError, User,
    UserId,
};
use globalperms_db_memory::InMemoryMembershipStore;
use globalperms_db_postgres::{PostgresError, PostgresMembershipSource};
use tracing::info;

use crate::aggregator::{GroupAggregator, GroupResolution};
use crate::config::{AppConfig, ConfigError, PermissionsConfig, SourceKind};
use crate::hooks::{CacheInvalidationHook, PermissionsHook};

/// Errors raised while starting up from configuration.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cache backend: {0}")]
    Cache(#[from] CacheError),

    #[error("Shard database: {0}")]
    Database(#[from] PostgresError),

    #[error(transparent)]
    Permissions(#[from] PermissionsError),
}

/// Global permissions: group resolution, invalidation and the read API.
pub struct GlobalPermissions {
    aggregator: Arc<GroupAggregator>,
    invalidation: Arc<CacheInvalidationHook>,
    permissions: Arc<PermissionsHook>,
    backend: Option<CacheBackend>,
}

impl GlobalPermissions {
    pub fn builder(config: PermissionsConfig) -> GlobalPermissionsBuilder {
        GlobalPermissionsBuilder::new(config)
    }

    /// Build everything described by `config`: cache backend, membership
    /// source and hooks.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        config.validate()?;

        let backend = create_cache_backend(&config.redis).await?;
        let source: DynMembershipSource = match config.permissions.source {
            SourceKind::Postgres => {
                Arc::new(PostgresMembershipSource::connect(&config.postgres.shards).await?)
            }
            SourceKind::Memory => {
                let store = InMemoryMembershipStore::new();
                for shard in &config.permissions.shards {
                    store.add_shard(shard.id.clone()).await;
                }
                Arc::new(store)
            }
        };

        let permissions = Self::builder(config.permissions.clone())
            .source(source)
            .cache_backend(backend)
            .cache_config(config.cache.clone())
            .build()?;

        info!(
            shards = config.permissions.shards.len(),
            local_shard = %config.permissions.local_shard,
            shared_cache = config.redis.enabled,
            "Global permissions initialized"
        );

        Ok(permissions)
    }

    /// Add `user`'s global groups to `groups`. See [`PermissionsHook::effective_groups`].
    pub async fn effective_groups(
        &self,
        user: &User,
        groups: &mut BTreeSet<GroupName>,
    ) -> Result<(), PermissionsError> {
        self.permissions.effective_groups(user, groups).await
    }

    /// See [`PermissionsHook::is_bot`].
    pub async fn is_bot(&self, user: &User) -> Result<bool, PermissionsError> {
        self.permissions.is_bot(user).await
    }

    pub async fn resolve_groups(&self, user: UserId) -> GroupResolution {
        self.aggregator.resolve_groups(user).await
    }

    pub async fn groups_for_user_id(&self, id: i64) -> GroupResolution {
        self.aggregator.groups_for_user_id(id).await
    }

    pub async fn groups_for_user(&self, user: &User) -> GroupResolution {
        self.aggregator.groups_for_user(user).await
    }

    /// Invalidate after a membership write. Never fails.
    pub async fn on_membership_changed(&self, change: &MembershipChange) {
        self.invalidation.on_membership_changed(change).await;
    }

    /// Drop `user`'s cached groups on every shard.
    pub async fn purge(&self, user: UserId) -> Result<(), CacheError> {
        self.aggregator.invalidate_all(user).await
    }

    /// Register the invalidation and permissions hooks with a host registry.
    pub async fn register_hooks(&self, registry: &HookRegistry) {
        registry
            .register_groups_changed(self.invalidation.clone())
            .await;
        registry
            .register_effective_groups(self.permissions.clone())
            .await;
    }

    pub fn aggregator(&self) -> &Arc<GroupAggregator> {
        &self.aggregator
    }

    pub fn invalidation_hook(&self) -> Arc<CacheInvalidationHook> {
        self.invalidation.clone()
    }

    pub fn permissions_hook(&self) -> Arc<PermissionsHook> {
        self.permissions.clone()
    }

    /// Cache statistics, if the cache backend is known.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.backend.as_ref().map(CacheBackend::stats)
    }

    /// `true` if the shared cache can be reached right now.
    pub async fn is_cache_available(&self) -> bool {
        match &self.backend {
            Some(backend) if backend.is_shared() => backend.is_redis_available().await,
            Some(_) => true,
            None => false,
        }
    }
}

impl std::fmt::Debug for GlobalPermissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalPermissions")
            .field("aggregator", &self.aggregator)
            .field("local_shard", &self.invalidation.local_shard())
            .finish_non_exhaustive()
    }
}

/// Builder for [`GlobalPermissions`] from explicit dependencies.
pub struct GlobalPermissionsBuilder {
    config: PermissionsConfig,
    cache_config: CacheConfig,
    source: Option<DynMembershipSource>,
    store: Option<Arc<dyn CacheStore>>,
    backend: Option<CacheBackend>,
}

impl GlobalPermissionsBuilder {
    fn new(config: PermissionsConfig) -> Self {
        Self {
            config,
            cache_config: CacheConfig::default(),
            source: None,
            store: None,
            backend: None,
        }
    }

    #[must_use]
    pub fn source(mut self, source: DynMembershipSource) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn cache_backend(mut self, backend: CacheBackend) -> Self {
        self.store = Some(Arc::new(backend.clone()));
        self.backend = Some(backend);
        self
    }

    /// Use a custom cache store. Stats and health are unavailable.
    #[must_use]
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self.backend = None;
        self
    }

    #[must_use]
    pub fn cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    /// Validate the configuration and wire the components.
    ///
    /// Without an explicit cache, a process-local store is used.
    pub fn build(self) -> Result<GlobalPermissions, PermissionsError> {
        self.config
            .validate()
            .map_err(PermissionsError::configuration)?;
        self.cache_config
            .validate()
            .map_err(PermissionsError::configuration)?;

        let source = self
            .source
            .ok_or_else(|| PermissionsError::configuration("no membership source configured"))?;

        let (store, backend) = match (self.store, self.backend) {
            (Some(store), backend) => (store, backend),
            (None, _) => {
                let backend = CacheBackend::new_local();
                let store: Arc<dyn CacheStore> = Arc::new(backend.clone());
                (store, Some(backend))
            }
        };

        let policy = self.cache_config.policy();
        let cache = CoordinatedCache::new(store)
            .with_busy_wait(
                self.cache_config.busy_wait(),
                self.cache_config.poll_interval(),
            )
            .with_purge_hold(policy.stale);

        let aggregator = Arc::new(GroupAggregator::new(
            self.config.descriptors(),
            self.config.pinned_groups(),
            source,
            cache,
            policy,
        ));

        Ok(GlobalPermissions {
            invalidation: Arc::new(CacheInvalidationHook::new(
                aggregator.clone(),
                self.config.local_shard.clone(),
            )),
            permissions: Arc::new(PermissionsHook::new(
                aggregator.clone(),
                self.config.bot_marker.clone(),
            )),
            aggregator,
            backend,
        })
    }
}
