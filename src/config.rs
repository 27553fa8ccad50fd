//! Application configuration management.
//!
//! This module handles loading and saving the client configuration,
//! which includes the API base URL, the authentication mode, and the
//! last used username.
//!
//! Configuration is stored at `~/.config/labclient/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "labclient";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default port the backend listens on when no base URL has been
/// configured yet (e.g. before the client has discovered its server).
pub const DEFAULT_API_PORT: u16 = 8338;

/// How credentials are presented to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` header on every request.
    #[default]
    Bearer,
    /// Credentials live in the cookie jar; no auth header is sent.
    Cookie,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Base URL of the backend, e.g. `http://192.168.1.10:8338`.
    /// When unset, requests fall back to localhost on [`DEFAULT_API_PORT`].
    pub api_base: Option<String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    pub last_username: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
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

    /// Directory for the fallback credential file and any on-disk caches.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
