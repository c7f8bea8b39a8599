//! Application configuration.
//!
//! ```toml
//! [permissions]
//! local_shard = "metawiki"
//!
//! [[permissions.shards]]
//! id = "metawiki"
//! allow = ["sysop", "bot", "sysop-bot"]
//!
//! [[permissions.pinned]]
//! group = "steward"
//! users = [42]
//!
//! [postgres.shards.metawiki]
//! url = "postgres://wikiuser@db1/centralauth"
//!
//! [redis]
//! enabled = true
//! url = "redis://cache1:6379"
//! ```

use std::collections::BTreeSet;

use globalperms_cache::{CacheConfig, RedisConfig};
use globalperms_core::{DEFAULT_BOT_MARKER, PinnedGroups, ShareDescriptor, UserId};
use globalperms_db_postgres::ShardDatabases;
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(String),

    #[error("config deserialize error: {0}")]
    Deserialize(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub postgres: PostgresSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.permissions.validate().map_err(ConfigError::Invalid)?;
        self.cache.validate().map_err(ConfigError::Invalid)?;

        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err(ConfigError::Invalid("redis.enabled=true requires redis.url".into()));
        }

        if self.permissions.source == SourceKind::Postgres {
            for shard in &self.permissions.shards {
                let url = self
                    .postgres
                    .shards
                    .get(&shard.id)
                    .map(|db| db.url.trim())
                    .unwrap_or("");
                if url.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "shard '{}' has no database URL (postgres.shards.{}.url)",
                        shard.id, shard.id
                    )));
                }
            }
        }

        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }

        Ok(())
    }
}

/// Where shard memberships are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// One PostgreSQL database per shard.
    #[default]
    Postgres,
    /// Process memory; starts empty.
    Memory,
}

/// One shard database and the groups it is authoritative for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: String,
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub source: SourceKind,

    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    /// Groups granted to fixed users without database access.
    #[serde(default)]
    pub pinned: Vec<PinnedConfig>,

    /// Shard whose cache entries are purged when memberships change here.
    #[serde(default)]
    pub local_shard: String,

    #[serde(default = "default_bot_marker")]
    pub bot_marker: String,
}

fn default_bot_marker() -> String {
    DEFAULT_BOT_MARKER.to_string()
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            shards: Vec::new(),
            pinned: Vec::new(),
            local_shard: String::new(),
            bot_marker: default_bot_marker(),
        }
    }
}

impl PermissionsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.shards.is_empty() {
            return Err("permissions.shards must not be empty".into());
        }

        let mut seen = BTreeSet::new();
        for shard in &self.shards {
            if shard.id.trim().is_empty() {
                return Err("permissions.shards: shard id must not be empty".into());
            }
            if !seen.insert(shard.id.as_str()) {
                return Err(format!("permissions.shards: duplicate shard id '{}'", shard.id));
            }
            if shard.allow.is_empty() {
                return Err(format!("shard '{}' has an empty allow list", shard.id));
            }
            if shard.allow.iter().any(|g| g.trim().is_empty()) {
                return Err(format!("shard '{}' allows an empty group name", shard.id));
            }
        }

        if !seen.contains(self.local_shard.as_str()) {
            return Err(format!(
                "permissions.local_shard '{}' is not a configured shard",
                self.local_shard
            ));
        }

        for pin in &self.pinned {
            if pin.group.trim().is_empty() {
                return Err("permissions.pinned: group name must not be empty".into());
            }
            if let Some(id) = pin.users.iter().find(|id| UserId::new(**id).is_anonymous()) {
                return Err(format!(
                    "permissions.pinned '{}': user id {id} is not a registered user",
                    pin.group
                ));
            }
        }

        if self.bot_marker.is_empty() {
            return Err("permissions.bot_marker must not be empty".into());
        }

        Ok(())
    }

    pub fn descriptors(&self) -> Vec<ShareDescriptor> {
        self.shards
            .iter()
            .map(|shard| ShareDescriptor::new(shard.id.clone(), shard.allow.iter().cloned()))
            .collect()
    }

    pub fn pinned_groups(&self) -> PinnedGroups {
        let mut pinned = PinnedGroups::new();
        for pin in &self.pinned {
            pinned.pin(pin.group.clone(), pin.users.iter().copied().map(UserId::new));
        }
        pinned
    }
}

/// One pinned group. A list of tables rather than a map, since the config
/// loader lowercases map keys and group names are case-sensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedConfig {
    pub group: String,
    #[serde(default)]
    pub users: Vec<i64>,
}

impl PinnedConfig {
    pub fn new(group: impl Into<String>, users: impl IntoIterator<Item = i64>) -> Self {
        Self {
            group: group.into(),
            users: users.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresSection {
    #[serde(default)]
    pub shards: ShardDatabases,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File, FileFormat};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "globalperms.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        let mut builder = Config::builder();
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf).format(FileFormat::Toml));
        }
        // Environment variable overrides, e.g., GLOBALPERMS__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("GLOBALPERMS")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Build(e.to_string()))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [permissions]
        local_shard = "metawiki"

        [[permissions.shards]]
        id = "metawiki"
        allow = ["sysop", "bot", "sysop-bot"]

        [[permissions.shards]]
        id = "commonswiki"
        allow = ["translator"]

        [[permissions.pinned]]
        group = "Steward"
        users = [42]

        [postgres.shards.metawiki]
        url = "postgres://wikiuser@db1/meta"

        [postgres.shards.commonswiki]
        url = "postgres://wikiuser@db2/commons"
    "#;

    fn sample() -> AppConfig {
        toml::from_str(SAMPLE).expect("sample config")
    }

    #[test]
    fn test_sample_is_valid() {
        let config = sample();
        config.validate().expect("valid");

        assert_eq!(config.permissions.bot_marker, "-bot");
        assert_eq!(config.cache.fresh_ttl_secs, 120);
        assert_eq!(config.cache.stale_ttl_secs, 300);
        assert!(!config.redis.enabled);

        let descriptors = config.permissions.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[1].allows(&"translator".into()));

        let pinned = config.permissions.pinned_groups();
        let groups: Vec<_> = pinned.groups_for(UserId::new(42)).collect();
        assert_eq!(groups.len(), 1);
    }

    fn invalid(mutate: impl FnOnce(&mut AppConfig)) -> String {
        let mut config = sample();
        mutate(&mut config);
        config.validate().expect_err("should be rejected").to_string()
    }

    #[test]
    fn test_rejects_empty_shard_list() {
        let err = invalid(|c| c.permissions.shards.clear());
        assert!(err.contains("must not be empty"));
    }

    #[test]
    fn test_rejects_duplicate_shard_ids() {
        let err = invalid(|c| c.permissions.shards[1].id = "metawiki".into());
        assert!(err.contains("duplicate shard id"));
    }

    #[test]
    fn test_rejects_empty_allow_list() {
        let err = invalid(|c| c.permissions.shards[0].allow.clear());
        assert!(err.contains("empty allow list"));
    }

    #[test]
    fn test_rejects_unknown_local_shard() {
        let err = invalid(|c| c.permissions.local_shard = "enwiki".into());
        assert!(err.contains("local_shard"));
    }

    #[test]
    fn test_rejects_bad_pinned_entries() {
        let err = invalid(|c| c.permissions.pinned.push(PinnedConfig::new("", [1])));
        assert!(err.contains("group name must not be empty"));

        let err = invalid(|c| c.permissions.pinned.push(PinnedConfig::new("steward", [0])));
        assert!(err.contains("not a registered user"));
    }

    #[test]
    fn test_rejects_shard_without_database_url() {
        let err = invalid(|c| {
            c.postgres.shards.remove("commonswiki");
        });
        assert!(err.contains("commonswiki"));
    }

    #[test]
    fn test_memory_source_needs_no_database_urls() {
        let mut config = sample();
        config.permissions.source = SourceKind::Memory;
        config.postgres.shards.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let err = invalid(|c| c.logging.level = "loud".into());
        assert!(err.contains("logging.level"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");

        let path = file.path().to_string_lossy().to_string();
        let config = loader::load_config(Some(&path)).expect("load");
        assert_eq!(config.permissions.local_shard, "metawiki");
        assert_eq!(config.permissions.shards[0].allow, vec!["sysop", "bot", "sysop-bot"]);
        assert_eq!(config.postgres.shards.len(), 2);

        // Values keep their case; only keys are folded by the loader.
        assert_eq!(config.permissions.pinned[0].group, "Steward");
        let pinned = config.permissions.pinned_groups();
        let groups: Vec<_> = pinned.groups_for(UserId::new(42)).map(|g| g.as_str()).collect();
        assert_eq!(groups, vec!["Steward"]);
    }

    #[test]
    fn test_missing_file_fails_validation() {
        let err = loader::load_config(Some("/nonexistent/globalperms.toml")).expect_err("no shards");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
