//! # Ledger Configuration
//!
//! Runtime settings for the storage backend, checkout limits and retries.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_STORAGE_BACKEND=memory                                       │
//! │     TALLY_DB_PATH=/var/lib/tally/tally.db                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.tally.ledger/tally.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     SQLite in the platform data directory                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [storage]
//! backend = "sqlite"            # memory | sqlite
//! database_path = "./tally.db"
//! max_connections = 5
//! acquire_timeout_secs = 30
//! busy_timeout_ms = 5000
//!
//! [checkout]
//! max_cart_lines = 100
//! max_line_quantity = 999
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 25
//! max_backoff_ms = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tally_core::{MAX_CART_ITEMS, MAX_ITEM_QUANTITY};
use tally_db::DbConfig;
use tracing::{debug, info, warn};

use crate::checkout::CheckoutLimits;
use crate::error::{ConfigError, ConfigResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Storage Backend
// =============================================================================

/// Which [`tally_db::LedgerStore`] implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory behind one lock. Lost on exit.
    Memory,

    /// SQLite file with serialized write transactions.
    #[default]
    Sqlite,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" | "mem" => Ok(StorageBackend::Memory),
            "sqlite" | "sqlite3" => Ok(StorageBackend::Sqlite),
            other => Err(ConfigError::InvalidConfig(format!(
                "Unknown storage backend: '{}'. Valid options: memory, sqlite",
                other
            ))),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite file. Defaults to `tally.db` in the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection (seconds).
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// How long a writer waits for the SQLite write lock (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            backend: StorageBackend::default(),
            database_path: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StorageSettings {
    /// The configured path, or the platform default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "tally", "ledger")
                .map(|dirs| dirs.data_dir().join("tally.db"))
        })
    }

    /// Pool settings for the SQLite backend.
    pub fn db_config(&self) -> ConfigResult<DbConfig> {
        let path = self.resolved_database_path().ok_or_else(|| {
            ConfigError::InvalidConfig("no database_path and no platform data directory".into())
        })?;
        Ok(DbConfig::new(path)
            .max_connections(self.max_connections)
            .connect_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms)))
    }
}

// =============================================================================
// Checkout Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSettings {
    /// Distinct SKUs per cart after normalisation.
    #[serde(default = "default_max_cart_lines")]
    pub max_cart_lines: usize,

    /// Units per SKU after normalisation.
    #[serde(default = "default_max_line_quantity")]
    pub max_line_quantity: i64,
}

fn default_max_cart_lines() -> usize {
    MAX_CART_ITEMS
}

fn default_max_line_quantity() -> i64 {
    MAX_ITEM_QUANTITY
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        CheckoutSettings {
            max_cart_lines: default_max_cart_lines(),
            max_line_quantity: default_max_line_quantity(),
        }
    }
}

impl CheckoutSettings {
    pub fn limits(&self) -> CheckoutLimits {
        CheckoutLimits {
            max_cart_lines: self.max_cart_lines,
            max_line_quantity: self.max_line_quantity,
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    25
}
fn default_max_backoff() -> u64 {
    500
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

// =============================================================================
// Main Ledger Configuration
// =============================================================================

/// Complete ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub checkout: CheckoutSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl LedgerConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading ledger config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load ledger config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// An in-memory configuration, for tests and demos.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.storage.backend == StorageBackend::Sqlite {
            if self.storage.resolved_database_path().is_none() {
                return Err(ConfigError::InvalidConfig(
                    "database_path is required for the sqlite backend".into(),
                ));
            }
            if self.storage.max_connections == 0 {
                return Err(ConfigError::InvalidConfig(
                    "max_connections must be greater than 0".into(),
                ));
            }
        }

        if self.checkout.max_cart_lines == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_cart_lines must be greater than 0".into(),
            ));
        }
        if self.checkout.max_line_quantity < 1 {
            return Err(ConfigError::InvalidConfig(
                "max_line_quantity must be at least 1".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidConfig(
                "initial_backoff_ms cannot exceed max_backoff_ms".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies `TALLY_*` overrides read through `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = var("TALLY_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => {
                    debug!(backend = %backend, "Overriding storage backend from environment");
                    self.storage.backend = parsed;
                }
                Err(_) => warn!(backend = %backend, "Unknown storage backend in environment"),
            }
        }

        if let Some(path) = var("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Some(max) = var("TALLY_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse::<u32>() {
                self.storage.max_connections = n;
            }
        }

        if let Some(attempts) = var("TALLY_RETRY_MAX_ATTEMPTS") {
            if let Ok(n) = attempts.parse::<u32>() {
                self.retry.max_attempts = n;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "ledger")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!("SQLite".parse::<StorageBackend>().unwrap(), StorageBackend::Sqlite);
        assert!("postgres".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.checkout.max_cart_lines, 100);
        assert_eq!(config.checkout.max_line_quantity, 999);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: LedgerConfig = toml::from_str(
            r#"
            [storage]
            backend = "memory"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.busy_timeout_ms, 5_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TALLY_STORAGE_BACKEND", "memory"),
            ("TALLY_DB_PATH", "/tmp/override.db"),
            ("TALLY_RETRY_MAX_ATTEMPTS", "7"),
            ("TALLY_MAX_CONNECTIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = LedgerConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(
            config.storage.database_path,
            Some(PathBuf::from("/tmp/override.db"))
        );
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.storage.max_connections, 5);
    }

    #[test]
    fn test_validation() {
        let mut config = LedgerConfig::in_memory();
        assert!(config.validate().is_ok());

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 1;
        config.retry.initial_backoff_ms = 1_000;
        assert!(config.validate().is_err());

        config.retry.initial_backoff_ms = 10;
        config.checkout.max_line_quantity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_db_config_uses_settings() {
        let mut settings = StorageSettings::default();
        settings.database_path = Some(PathBuf::from("/tmp/tally-test.db"));
        settings.busy_timeout_ms = 250;

        let db = settings.db_config().unwrap();
        assert_eq!(db.database_path, PathBuf::from("/tmp/tally-test.db"));
        assert_eq!(db.busy_timeout, Duration::from_millis(250));
        assert_eq!(db.max_connections, 5);
    }
}
