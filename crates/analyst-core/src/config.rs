//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend base URL, where credentials are persisted, the last used username,
//! and the session timing knobs.
//!
//! Configuration is stored at `~/.config/analyst-workspace/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "analyst-workspace";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the backend base URL
pub const API_URL_ENV: &str = "ANALYST_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3002";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

/// Periods and thresholds driving the session scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTiming {
    pub health_check_secs: u64,
    pub fallback_refresh_secs: u64,
    pub countdown_tick_secs: u64,
    /// Remaining lifetime at or below which the health check quick-refreshes
    pub expiring_soon_secs: i64,
    /// Pause between the session-expired notice and the redirect
    pub redirect_delay_secs: u64,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            health_check_secs: 30,
            fallback_refresh_secs: 240,
            countdown_tick_secs: 1,
            expiring_soon_secs: crate::auth::EXPIRING_SOON_SECS,
            redirect_delay_secs: 3,
        }
    }
}

impl SessionTiming {
    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_secs.max(1))
    }

    pub fn fallback_refresh_period(&self) -> Duration {
        Duration::from_secs(self.fallback_refresh_secs.max(1))
    }

    pub fn countdown_period(&self) -> Duration {
        Duration::from_secs(self.countdown_tick_secs.max(1))
    }

    pub fn redirect_delay(&self) -> Duration {
        Duration::from_secs(self.redirect_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage: StorageBackend,
    pub last_username: Option<String>,
    pub request_timeout_secs: u64,
    pub timing: SessionTiming,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage: StorageBackend::default(),
            last_username: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            timing: SessionTiming::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.api_base_url = url.to_string();
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
