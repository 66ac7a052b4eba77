//! Client configuration management.
//!
//! This module handles loading and saving the client configuration: backend
//! base URLs, the network timeout and where tokens are stored.
//!
//! Configuration is stored at `~/.config/qapartment/config.json` and can be
//! overridden with `QAPT_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};

/// Application name used for config directory paths
const APP_NAME: &str = "qapartment";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_ADMIN_API_BASE_URL: &str = "http://localhost:8080/api/admin";

/// Per-call network timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub const ENV_API_BASE_URL: &str = "QAPT_API_BASE_URL";
pub const ENV_ADMIN_API_BASE_URL: &str = "QAPT_ADMIN_API_BASE_URL";
pub const ENV_TIMEOUT_SECS: &str = "QAPT_TIMEOUT_SECS";
pub const ENV_TOKEN_STORAGE: &str = "QAPT_TOKEN_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorage {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for TokenStorage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(TokenStorage::File),
            "keyring" => Ok(TokenStorage::Keyring),
            "memory" => Ok(TokenStorage::Memory),
            other => Err(anyhow!("Unknown token storage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub admin_api_base_url: String,
    pub timeout_secs: u64,
    pub token_storage: TokenStorage,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            admin_api_base_url: DEFAULT_ADMIN_API_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            token_storage: TokenStorage::default(),
        }
    }
}

impl ClientConfig {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
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
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `QAPT_*` overrides using `lookup` to read variables.
    /// Unparseable values are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_BASE_URL) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup(ENV_ADMIN_API_BASE_URL) {
            self.admin_api_base_url = url;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.timeout_secs = secs,
                _ => warn!(value = %raw, "Ignoring invalid {}", ENV_TIMEOUT_SECS),
            }
        }
        if let Some(raw) = lookup(ENV_TOKEN_STORAGE) {
            match raw.parse() {
                Ok(storage) => self.token_storage = storage,
                Err(e) => warn!(error = %e, "Ignoring invalid {}", ENV_TOKEN_STORAGE),
            }
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Build the configured token store.
    pub fn open_store(&self) -> Result<Arc<dyn TokenStore>> {
        let store: Arc<dyn TokenStore> = match self.token_storage {
            TokenStorage::File => Arc::new(FileTokenStore::open_default()?),
            TokenStorage::Keyring => Arc::new(KeyringTokenStore::new()),
            TokenStorage::Memory => Arc::new(MemoryTokenStore::new()),
        };
        Ok(store)
    }
}

// ============================================================================
// Tests
// ============================================================================
