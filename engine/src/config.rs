//! Engine configuration.
//!
//! Configuration is fixed for the lifetime of a session. It can be built in
//! code, deserialized from JSON, or loaded from `TANDEM_*` environment
//! variables.

use crate::reconcile::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Value meaning "no limit" for capacity fields.
pub const UNSPECIFIED: i64 = -1;

/// Resource limits of one datastore's change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityConfig {
    /// Estimated byte budget for change records, -1 if unspecified
    pub max_memory: i64,
    /// Maximum number of change records, -1 if unspecified
    pub max_items: i64,
    /// Allow read-only inspection while a session holds the store
    pub shared_memory: bool,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_memory: UNSPECIFIED,
            max_items: UNSPECIFIED,
            shared_memory: false,
        }
    }
}

impl CapacityConfig {
    pub fn new(max_memory: i64, max_items: i64, shared_memory: bool) -> Self {
        Self {
            max_memory,
            max_items,
            shared_memory,
        }
    }

    /// Builder-style method to cap the record count.
    pub fn with_max_items(mut self, max_items: i64) -> Self {
        self.max_items = max_items;
        self
    }

    /// Builder-style method to cap the estimated memory.
    pub fn with_max_memory(mut self, max_memory: i64) -> Self {
        self.max_memory = max_memory;
        self
    }

    pub fn with_shared_memory(mut self, shared_memory: bool) -> Self {
        self.shared_memory = shared_memory;
        self
    }

    pub fn item_limit(&self) -> Option<usize> {
        limit(self.max_items)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        limit(self.max_memory)
    }

    /// Reject negative values other than -1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("maxMemory", self.max_memory), ("maxItems", self.max_items)] {
            if value < UNSPECIFIED {
                return Err(ConfigError::InvalidCapacity {
                    field: name,
                    value,
                });
            }
        }
        Ok(())
    }
}

fn limit(value: i64) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Engine wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Default limits for sessions that do not pass their own
    pub capacity: CapacityConfig,
    /// Policy for conflicting concurrent edits
    pub conflict_strategy: ConflictStrategy,
    /// Abort pairwise slow sync after this many comparisons
    pub slow_sync_compare_limit: Option<u64>,
    /// Generations an unacknowledged remote deletion is retried before it
    /// is purged
    pub delete_retention: Option<u64>,
    /// Directory for file backed change logs
    pub store_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: CapacityConfig::default(),
            conflict_strategy: ConflictStrategy::Surface,
            slow_sync_compare_limit: None,
            delete_retention: None,
            store_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: CapacityConfig) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_slow_sync_compare_limit(mut self, limit: u64) -> Self {
        self.slow_sync_compare_limit = Some(limit);
        self
    }

    pub fn with_delete_retention(mut self, generations: u64) -> Self {
        self.delete_retention = Some(generations);
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `TANDEM_MAX_MEMORY` | `capacity.max_memory` |
    /// | `TANDEM_MAX_ITEMS` | `capacity.max_items` |
    /// | `TANDEM_SHARED_MEMORY` | `capacity.shared_memory` |
    /// | `TANDEM_CONFLICT_STRATEGY` | `conflict_strategy` |
    /// | `TANDEM_SLOW_SYNC_COMPARE_LIMIT` | `slow_sync_compare_limit` |
    /// | `TANDEM_DELETE_RETENTION` | `delete_retention` |
    /// | `TANDEM_STORE_DIR` | `store_dir` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("TANDEM_MAX_MEMORY") {
            config.capacity.max_memory = parse_number("TANDEM_MAX_MEMORY", &value)?;
        }
        if let Some(value) = lookup("TANDEM_MAX_ITEMS") {
            config.capacity.max_items = parse_number("TANDEM_MAX_ITEMS", &value)?;
        }
        if let Some(value) = lookup("TANDEM_SHARED_MEMORY") {
            config.capacity.shared_memory = parse_bool("TANDEM_SHARED_MEMORY", &value)?;
        }
        if let Some(value) = lookup("TANDEM_CONFLICT_STRATEGY") {
            config.conflict_strategy = value.parse()?;
        }
        if let Some(value) = lookup("TANDEM_SLOW_SYNC_COMPARE_LIMIT") {
            config.slow_sync_compare_limit =
                Some(parse_number("TANDEM_SLOW_SYNC_COMPARE_LIMIT", &value)?);
        }
        if let Some(value) = lookup("TANDEM_DELETE_RETENTION") {
            config.delete_retention = Some(parse_number("TANDEM_DELETE_RETENTION", &value)?);
        }
        config.store_dir = lookup("TANDEM_STORE_DIR").map(PathBuf::from);

        config.capacity.validate()?;
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a number, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be a boolean, got '{value}'")]
    InvalidBool { var: &'static str, value: String },

    #[error("unknown conflict strategy '{0}'")]
    UnknownStrategy(String),

    #[error("{field} must be -1 or a non-negative value, got {value}")]
    InvalidCapacity { field: &'static str, value: i64 },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}
