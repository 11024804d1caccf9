//! Configuration management

use crate::error::{ErrorContext, StasisError, StasisResult};
use crate::logging::LoggingConfig;
use crate::types::ConcurrencyStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StasisConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What `acquire` does with a session the backend has never seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSessionPolicy {
    /// Fail with `NotFound`
    #[default]
    Reject,
    /// Hand out an empty snapshot with no revision
    StartEmpty,
}

/// Session manager options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Concurrency-control strategy
    pub strategy: ConcurrencyStrategy,
    /// How long a ReadWrite acquisition may wait for the session lock
    pub lock_timeout_ms: u64,
    /// Longest a lock may be held before the watchdog breaks it
    pub max_hold_ms: u64,
    /// How often the watchdog looks for overdue locks
    pub sweep_interval_ms: u64,
    /// Handling of unknown session ids
    pub missing_session: MissingSessionPolicy,
    /// Number of applied granular operations kept in the in-memory journal
    pub operation_log_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strategy: ConcurrencyStrategy::Locking,
            lock_timeout_ms: 5_000,
            max_hold_ms: 30_000,
            sweep_interval_ms: 1_000,
            missing_session: MissingSessionPolicy::Reject,
            operation_log_capacity: 256,
        }
    }
}

impl ManagerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn max_hold(&self) -> Duration {
        Duration::from_millis(self.max_hold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate option ranges
    pub fn validate(&self) -> StasisResult<()> {
        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms must be greater than 0", "manager.lock_timeout_ms"));
        }
        if self.max_hold_ms == 0 {
            return Err(invalid("max_hold_ms must be greater than 0", "manager.max_hold_ms"));
        }
        if self.sweep_interval_ms == 0 || self.sweep_interval_ms > self.max_hold_ms {
            return Err(invalid(
                "sweep_interval_ms must be between 1 and max_hold_ms",
                "manager.sweep_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process storage (tests, single node)
    #[default]
    Memory,
    /// SQLite file database
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type
    pub backend: StorageKind,
    /// Connection string or file path
    pub connection: String,
    /// Maximum number of database connections
    pub max_connections: u32,
    /// Run embedded migrations on startup
    pub auto_migrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Memory,
            connection: "sqlite://stasis_sessions.db?mode=rwc".to_string(),
            max_connections: 10,
            auto_migrate: true,
        }
    }
}

impl StasisConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> StasisResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StasisError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> StasisResult<Self> {
        let config: StasisConfig = toml::from_str(content).map_err(|e| StasisError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> StasisResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| StasisError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        std::fs::write(path, content).map_err(|e| StasisError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> StasisResult<()> {
        self.manager.validate()?;

        if self.storage.backend == StorageKind::Sqlite && self.storage.connection.is_empty() {
            return Err(invalid(
                "storage.connection is required for the sqlite backend",
                "storage.connection",
            ));
        }

        if self.storage.max_connections == 0 {
            return Err(invalid(
                "storage.max_connections must be greater than 0",
                "storage.max_connections",
            ));
        }

        Ok(())
    }
}

fn invalid(message: &str, field: &str) -> StasisError {
    StasisError::Config {
        message: message.to_string(),
        source: None,
        context: ErrorContext::new("config")
            .with_operation("validate")
            .with_metadata("field", field),
    }
}
