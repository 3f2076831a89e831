//! Application configuration management.
//!
//! Holds the API location, timing knobs for the session, and the last email
//! used to log in. Configuration is stored at
//! `~/.config/marquee/config.json`; values missing from the file fall back to
//! defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::{DEFAULT_BASE_URL, REQUEST_TIMEOUT_SECS};
use crate::auth::{SessionConfig, DEFAULT_REVALIDATION_INTERVAL};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "marquee";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "MARQUEE_API_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub revalidation_interval_secs: u64,
    /// Encrypt the credential file with a keychain-held secret
    pub encrypt_credentials: bool,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            revalidation_interval_secs: DEFAULT_REVALIDATION_INTERVAL.as_secs(),
            encrypt_credentials: true,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
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

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the credential file
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Base URL by precedence: explicit override, environment, config file, default
    pub fn resolve_base_url(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| std::env::var(API_URL_ENV).ok().filter(|v| !v.is_empty()))
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            revalidation_interval: Duration::from_secs(self.revalidation_interval_secs.max(1)),
        }
    }
}
