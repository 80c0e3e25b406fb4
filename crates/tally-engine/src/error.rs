//! # Startup Error Types
//!
//! Failures while loading configuration or opening the configured store.
//! Ledger operations themselves report [`tally_core::LedgerError`].

use thiserror::Error;

/// Result type alias for configuration and startup.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting is missing or out of range.
    #[error("Invalid ledger configuration: {0}")]
    InvalidConfig(String),

    /// The config file exists but could not be read or parsed.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// The configured database could not be opened.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] tally_db::DbError),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ConfigLoadFailed(err.to_string())
    }
}

impl ConfigError {
    /// Returns true for problems fixed by editing the configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ConfigError::InvalidConfig(_) | ConfigError::ConfigLoadFailed(_)
        )
    }
}
