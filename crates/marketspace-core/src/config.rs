//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! which API to talk to, where the session is stored, and the last email
//! used to sign in.
//!
//! Configuration is stored at `~/.config/marketspace/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::SessionOptions;
use crate::storage::{FileStore, KeyValueStore, KeyringStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "marketspace";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Subdirectory of the data directory holding the session files
const SESSION_DIR: &str = "session";

/// Subdirectory of the data directory holding log files
const LOG_DIR: &str = "logs";

/// API used when nothing else is configured (the development server)
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3333";

const DEFAULT_TOKEN_FLUSH_DELAY_MS: u64 = 2000;

/// Where the session is persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON files in the data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_token_flush_delay_ms() -> u64 {
    DEFAULT_TOKEN_FLUSH_DELAY_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub storage_backend: StorageBackend,
    #[serde(default = "default_token_flush_delay_ms")]
    pub token_flush_delay_ms: u64,
    #[serde(default)]
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            storage_backend: StorageBackend::default(),
            token_flush_delay_ms: DEFAULT_TOKEN_FLUSH_DELAY_MS,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
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

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(LOG_DIR))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            token_flush_delay: Duration::from_millis(self.token_flush_delay_ms),
        }
    }

    /// Build the key-value store selected by `storage_backend`
    pub fn open_store(&self) -> Result<Arc<dyn KeyValueStore>> {
        Ok(match self.storage_backend {
            StorageBackend::File => Arc::new(FileStore::new(self.data_dir()?.join(SESSION_DIR))),
            StorageBackend::Keyring => Arc::new(KeyringStore::default()),
        })
    }
}
