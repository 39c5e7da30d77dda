//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/syncvault/config.toml)
//! 3. Environment variables (SYNCVAULT_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::CollectionConfig;
use crate::pool::PoolConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "SYNCVAULT";

/// Which layout strategy backs the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutKind {
    /// All documents in one table, one JSON blob per row
    #[default]
    Shared,
    /// One table per collection with optional per-field indexes
    PerCollection,
}

/// Pool sizing, serde-friendly (durations in milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// `None` disables idle eviction
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub validate_on_checkout: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            validate_on_checkout: true,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig {
            max_size: settings.max_size,
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            idle_timeout: settings.idle_timeout_ms.map(Duration::from_millis),
            validate_on_checkout: settings.validate_on_checkout,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the embedded database file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Layout strategy for collections
    #[serde(default)]
    pub layout: LayoutKind,

    /// Per-collection index and encryption configuration
    #[serde(default)]
    pub collections: HashMap<String, CollectionConfig>,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            layout: LayoutKind::default(),
            collections: HashMap::new(),
            pool: PoolSettings::default(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SYNCVAULT_DATA_DIR, SYNCVAULT_LAYOUT, ...)
    /// 2. Config file (~/.config/syncvault/config.toml or SYNCVAULT_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: StoreConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Full path to the embedded database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    /// Pool configuration derived from the serde settings
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from(&self.pool)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LAYOUT", ENV_PREFIX)) {
            match val.as_str() {
                "shared" => self.layout = LayoutKind::Shared,
                "per-collection" => self.layout = LayoutKind::PerCollection,
                _ => {}
            }
        }

        if let Ok(val) = std::env::var(format!("{}_POOL_MAX_SIZE", ENV_PREFIX)) {
            if let Ok(size) = val.parse() {
                self.pool.max_size = size;
            }
        }
    }

    /// Path to the config file (respects SYNCVAULT_CONFIG)
    fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("syncvault")
            .join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("syncvault")
}

fn default_database_file() -> String {
    "syncvault.db".to_string()
}

fn default_pool_max_size() -> usize {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> Option<u64> {
    Some(300_000)
}

fn default_true() -> bool {
    true
}
