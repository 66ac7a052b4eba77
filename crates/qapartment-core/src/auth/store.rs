//! Durable key-value storage for the access token, refresh token and the
//! cached user profile.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};

/// Application name used for cache directory paths and the keychain service
const APP_NAME: &str = "qapartment";

/// Token file name in the cache directory
const TOKEN_FILE: &str = "tokens.json";

/// Keys held in a [`TokenStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AccessToken,
    RefreshToken,
    User,
}

impl StorageKey {
    pub const ALL: [StorageKey; 3] = [
        StorageKey::AccessToken,
        StorageKey::RefreshToken,
        StorageKey::User,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageKey::AccessToken => "access_token",
            StorageKey::RefreshToken => "refresh_token",
            StorageKey::User => "user",
        }
    }
}

/// Durable storage shared by every caller of the client.
///
/// Implementations must be safe to call from several tasks at once. The
/// client serialises its own multi-key writes, so a single `set` only has to
/// be atomic for its own key.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: StorageKey) -> Result<Option<String>>;

    fn set(&self, key: StorageKey, value: &str) -> Result<()>;

    /// Removing a key that is not present is not an error.
    fn remove(&self, key: StorageKey) -> Result<()>;

    /// Remove every key.
    fn clear(&self) -> Result<()> {
        for key in StorageKey::ALL {
            self.remove(key)?;
        }
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<StorageKey, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<StorageKey, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("Token store lock poisoned"))
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: StorageKey) -> Result<Option<String>> {
        Ok(self.entries()?.get(&key).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        self.entries()?.insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: StorageKey) -> Result<()> {
        self.entries()?.remove(&key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries()?.clear();
        Ok(())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    entries: BTreeMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Stores tokens as a JSON document in the user's cache directory.
pub struct FileTokenStore {
    path: PathBuf,
    // Serialises read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Open the store at its default location,
    /// `<cache dir>/qapartment/tokens.json`.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn default_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(TOKEN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the file was last written, if it exists.
    pub fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.guard()?;
        Ok(self.read()?.updated_at)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("Token file lock poisoned"))
    }

    fn read(&self) -> Result<StoredTokens> {
        if !self.path.exists() {
            return Ok(StoredTokens::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse token file {}", self.path.display()))
    }

    fn write(&self, mut stored: StoredTokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        stored.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write token file {}", self.path.display()))
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: StorageKey) -> Result<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.read()?.entries.get(key.as_str()).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut stored = self.read()?;
        stored
            .entries
            .insert(key.as_str().to_string(), value.to_string());
        self.write(stored)
    }

    fn remove(&self, key: StorageKey) -> Result<()> {
        let _guard = self.guard()?;
        // A corrupt file is replaced rather than blocking removal
        let mut stored = self.read().unwrap_or_default();
        if stored.entries.remove(key.as_str()).is_some() {
            self.write(stored)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.guard()?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete token file {}", self.path.display()))?;
        }
        Ok(())
    }
}

// ============================================================================
// OS keychain store
// ============================================================================

/// Stores each key as its own entry in the OS keychain.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self::with_service(APP_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: StorageKey) -> Result<Entry> {
        Entry::new(&self.service, key.as_str()).context("Failed to create keyring entry")
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for KeyringTokenStore {
    fn get(&self, key: StorageKey) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read token from keychain"),
        }
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store token in keychain")
    }

    fn remove(&self, key: StorageKey) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
