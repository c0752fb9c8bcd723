//! Configuration management for the key manager
//!
//! Values are layered: built-in defaults, then an optional config file,
//! then `KEYMGR__*` environment variables (a `.env` file is honoured).

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "KEYMGR_CONFIG";

/// Prefix for environment overrides, e.g. `KEYMGR__PROVIDER_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "KEYMGR";

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Key manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KeyManagerConfig {
    /// Absorb failures of individual providers during fan-out reads
    /// as long as at least one provider answered
    pub resolve_provider_errors: bool,
    /// Per-provider timeout for fan-out reads, `0` disables it
    pub provider_timeout_ms: u64,
    /// Preference rank per provider id (lower is preferred)
    #[serde(default)]
    pub provider_ranks: HashMap<String, u32>,
    /// Directory of the software keyring (in-memory when unset)
    #[serde(default)]
    pub key_storage_path: Option<String>,
    /// Trust record file (in-memory when unset)
    #[serde(default)]
    pub trust_store_path: Option<String>,
    pub log_level: String,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            resolve_provider_errors: true,
            provider_timeout_ms: 5000,
            provider_ranks: HashMap::new(),
            key_storage_path: None,
            trust_store_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl KeyManagerConfig {
    /// Load configuration from `KEYMGR_CONFIG` (if set) and the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(Some(Path::new(&path))),
            Err(_) => Self::load(None),
        }
    }

    /// Load configuration from an optional file plus environment overrides
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("resolve_provider_errors", defaults.resolve_provider_errors)?
            .set_default("provider_timeout_ms", defaults.provider_timeout_ms as i64)?
            .set_default("log_level", defaults.log_level.clone())?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("log_level must not be empty".to_string()));
        }
        if self.provider_ranks.keys().any(|id| id.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "provider_ranks contains an empty provider id".to_string(),
            ));
        }
        Ok(())
    }

    /// Fan-out timeout, `None` when disabled
    pub fn provider_timeout(&self) -> Option<Duration> {
        if self.provider_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.provider_timeout_ms))
        }
    }

    /// Preference rank for a provider; unlisted providers rank after all listed ones
    pub fn rank_for(&self, provider_id: &str) -> u32 {
        self.provider_ranks
            .get(provider_id)
            .copied()
            .unwrap_or_else(|| self.provider_ranks.values().max().map_or(0, |max| max + 1))
    }

    /// Get log level
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}
