//! Configuration management for Cardflow services.
//!
//! Hosts share a configuration file at `~/.cardflow/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (CARDFLOW_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `CARDFLOW_LOG_LEVEL` → observability.log_level
//! - `CARDFLOW_LOG_FORMAT` → observability.log_format
//! - `CARDFLOW_DATA_DIR` → storage.data_dir
//! - `CARDFLOW_STORAGE_BACKEND` → storage.backend
//! - `CARDFLOW_MAX_RETRIES` → automation.default_max_retries

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(
            || PathBuf::from(".cardflow"),
            |dirs| dirs.home_dir().join(".cardflow"),
        )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Automation Configuration
// ============================================================================

/// Storage key conventions and engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Fixed key holding the list of in-flight automation runs
    #[serde(default = "default_runs_key")]
    pub runs_key: String,

    /// Prefix for per-board card list keys (`{prefix}:{board_id}`)
    #[serde(default = "default_cards_key_prefix")]
    pub cards_key_prefix: String,

    /// Key holding the list of boards
    #[serde(default = "default_boards_key")]
    pub boards_key: String,

    /// Capacity of the automation observer channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry budget given to boards created without an explicit one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            runs_key: default_runs_key(),
            cards_key_prefix: default_cards_key_prefix(),
            boards_key: default_boards_key(),
            event_capacity: default_event_capacity(),
            default_max_retries: default_max_retries(),
        }
    }
}

fn default_runs_key() -> String {
    "automation-runs".into()
}

fn default_cards_key_prefix() -> String {
    "cards".into()
}

fn default_boards_key() -> String {
    "boards".into()
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_retries() -> u32 {
    3
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process map, lost on exit.
    #[default]
    Memory,
    /// One JSON document per key under `data_dir`.
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            other => anyhow::bail!("Unknown storage backend: {}", other),
        }
    }
}

/// Key-value storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend used for boards, cards and runs
    #[serde(default)]
    pub backend: StorageBackend,

    /// Data directory for the file backend (default: ~/.cardflow/data)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Identity token of the store. Two stores with different tokens never
    /// share a mutation slot, even for equal keys.
    #[serde(default = "default_store_id")]
    pub store_id: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: None,
            store_id: default_store_id(),
        }
    }
}

impl StorageConfig {
    /// Effective data directory for the file backend.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("data"))
    }
}

fn default_store_id() -> String {
    "committed".into()
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to set to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration shared by Cardflow hosts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Automation engine settings
    #[serde(default)]
    pub automation: AutomationConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides, then validate.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("CARDFLOW_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("CARDFLOW_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Some(dir) = lookup("CARDFLOW_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(backend) = lookup("CARDFLOW_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(b) => self.storage.backend = b,
                Err(e) => tracing::warn!(error = %e, "Ignoring CARDFLOW_STORAGE_BACKEND"),
            }
        }
        if let Some(retries) = lookup("CARDFLOW_MAX_RETRIES") {
            match retries.parse() {
                Ok(r) => self.automation.default_max_retries = r,
                Err(e) => tracing::warn!(error = %e, "Ignoring CARDFLOW_MAX_RETRIES"),
            }
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let automation = &self.automation;
        if automation.runs_key.trim().is_empty() {
            anyhow::bail!("automation.runs_key must not be empty");
        }
        if automation.cards_key_prefix.trim().is_empty() {
            anyhow::bail!("automation.cards_key_prefix must not be empty");
        }
        if automation.boards_key.trim().is_empty() {
            anyhow::bail!("automation.boards_key must not be empty");
        }
        if automation.event_capacity == 0 {
            anyhow::bail!("automation.event_capacity must be greater than zero");
        }
        if self.storage.store_id.trim().is_empty() {
            anyhow::bail!("storage.store_id must not be empty");
        }
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.automation.runs_key, "automation-runs");
        assert_eq!(config.automation.cards_key_prefix, "cards");
        assert_eq!(config.automation.boards_key, "boards");
        assert_eq!(config.automation.default_max_retries, 3);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.store_id, "committed");
        assert_eq!(config.observability.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{"storage": {"backend": "file"}, "observability": {"level": "debug"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.automation.event_capacity, 256);
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.automation.default_max_retries = 5;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.automation.default_max_retries, 5);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CARDFLOW_LOG_LEVEL", "trace"),
            ("CARDFLOW_DATA_DIR", "/tmp/cardflow"),
            ("CARDFLOW_STORAGE_BACKEND", "FILE"),
            ("CARDFLOW_MAX_RETRIES", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.observability.log_level, "trace");
        assert_eq!(config.storage.data_dir(), PathBuf::from("/tmp/cardflow"));
        assert_eq!(config.storage.backend, StorageBackend::File);
        // Unparseable values are ignored
        assert_eq!(config.automation.default_max_retries, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.automation.event_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.automation.runs_key = "  ".into();
        assert!(config.validate().is_err());
    }
}
