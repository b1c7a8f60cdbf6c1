//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Snapshot interval used when the config file does not set one
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 250;

/// Model used when neither the command line nor the config names one
pub const FALLBACK_MODEL: &str = "anthropic:claude-sonnet-4";

/// Configuration for confab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model to bill replayed turns against
    pub default_model: Option<String>,
    /// Milliseconds between persisted snapshots of a streaming turn
    pub snapshot_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: None,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("confab")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CONFAB_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, falling back to defaults on any problem
    pub fn load_from(path: &PathBuf) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Self {
        match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &PathBuf) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            default_model: Some(FALLBACK_MODEL.to_string()),
            ..Config::default()
        };
        default_config.save_to(&path)?;
        Ok(path)
    }

    /// Pick the model: explicit choice, then config, then the fallback
    pub fn model(&self, explicit: Option<String>) -> String {
        explicit
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string())
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# confab configuration file
# Place at ~/.config/confab/config.toml (Linux/Mac) or %APPDATA%\confab\config.toml (Windows)
# or point CONFAB_CONFIG_PATH at it

# Model replayed turns are billed against
default_model = "anthropic:claude-sonnet-4"

# Milliseconds between persisted snapshots while a turn streams
snapshot_interval_ms = 250

# Credit settings come from the environment:
#   CONFAB_CREDIT_MARKUP         multiplier on provider prices (default 1.0)
#   CONFAB_SUBSCRIPTION_CREDITS  credits included per period (default 10000)
#   CONFAB_CREDIT_PACK_SIZE      credits per purchased pack (default 20000)
#   CONFAB_UNRESTRICTED          set to 1 to disable billing
"#
}
