use thiserror::Error;

/// Errors returned by a [`crate::MembershipSource`].
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    #[error("Shard {shard} unavailable: {message}")]
    Unavailable { shard: String, message: String },

    #[error("Query against shard {shard} failed: {message}")]
    Query { shard: String, message: String },
}

impl SourceError {
    pub fn unknown_shard(shard: impl Into<String>) -> Self {
        Self::UnknownShard(shard.into())
    }

    pub fn unavailable(shard: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            shard: shard.into(),
            message: message.into(),
        }
    }

    pub fn query(shard: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            shard: shard.into(),
            message: message.into(),
        }
    }
}

/// One shard that could not contribute to a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard: String,
    pub message: String,
}

impl std::fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.shard, self.message)
    }
}

/// Errors for global permission resolution.
#[derive(Debug, Error)]
pub enum PermissionsError {
    #[error("Resolution incomplete, failed shards: {}", format_failures(.failed))]
    PartialResolution { failed: Vec<ShardFailure> },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PermissionsError {
    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns `true` if some shards failed while others answered.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialResolution { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Failed shard ids of a partial resolution.
    pub fn failed_shards(&self) -> Vec<&str> {
        match self {
            Self::PartialResolution { failed } => failed.iter().map(|f| f.shard.as_str()).collect(),
            Self::Configuration(_) => Vec::new(),
        }
    }
}

fn format_failures(failed: &[ShardFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for global permission operations
pub type Result<T> = std::result::Result<T, PermissionsError>;
