// Cache configuration
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::logging::LoggingConfig;
use crate::storage::persist::DEFAULT_PERSIST_INTERVAL;
use crate::CacheOptions;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Cache sizing and persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Instance name, attached to every log line.
    pub name: String,
    pub capacity: usize,
    /// Snapshot file; unset or blank keeps the cache in memory only.
    pub cache_path: Option<String>,
    pub persist_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "ipcache".to_string(),
            capacity: 1000,
            cache_path: None,
            persist_interval_ms: DEFAULT_PERSIST_INTERVAL.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn to_options(&self) -> CacheOptions {
        CacheOptions {
            name: self.name.clone(),
            capacity: self.capacity,
            cache_path: self.cache_path.clone(),
            persist_interval: self.persist_interval(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppConfig {
    /// Load from a YAML file, or JSON when the extension is `.json`.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("Configuration file not found, using defaults: {:?}", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config = if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        debug!("Configuration loaded from: {:?}", path);
        Ok(config)
    }

    /// Override fields from `IPCACHE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("IPCACHE_NAME") {
            self.cache.name = name;
        }
        if let Some(capacity) = lookup("IPCACHE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.cache.capacity = capacity;
        }
        if let Some(path) = lookup("IPCACHE_CACHE_PATH") {
            self.cache.cache_path = Some(path);
        }
        if let Some(ms) = lookup("IPCACHE_PERSIST_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.cache.persist_interval_ms = ms;
        }
        if let Some(level) = lookup("IPCACHE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache.capacity <= 1 {
            errors.push("Cache capacity must be bigger than 1".to_string());
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.level.as_str()) {
            errors.push(format!("Invalid logging level: {}", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
