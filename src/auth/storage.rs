//! Credential storage backends.
//!
//! Tokens and the active team selection are persisted through a small
//! [`CredentialStorage`] strategy interface with three implementations:
//!
//! - [`KeyringStorage`]: the OS keychain, preferred when available
//! - [`FileStorage`]: a JSON file in the platform cache directory,
//!   fallback for environments without a usable keychain
//! - [`MemoryStorage`]: ephemeral, for tests and throwaway sessions
//!
//! The backend is selected once at startup by [`detect_storage`] and
//! injected into the session manager; callers never branch on backend
//! kind at use sites.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

/// Keyring service name under which credential keys are stored
const SERVICE_NAME: &str = "labclient";

/// File name for the fallback credential store
const CREDENTIALS_FILE: &str = "credentials.json";

/// Key used by [`detect_storage`] to probe keychain availability
const PROBE_KEY: &str = "storage-probe";

/// Key/value persistence for session credentials.
///
/// Deleting a key removes it entirely; `get` of an absent key returns
/// `Ok(None)`, never an empty string. Callers distinguish "never set"
/// from "cleared" by absence alone.
pub trait CredentialStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Short backend name for log lines.
    fn name(&self) -> &'static str;
}

impl<T: CredentialStorage + ?Sized> CredentialStorage for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
    fn name(&self) -> &'static str {
        (**self).name()
    }
}

// ============================================================================
// OS keychain backend
// ============================================================================

/// Credential storage backed by the OS keychain.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStorage for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read credential from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Credential storage backed by a JSON file in the cache directory.
///
/// Used when no OS keychain is available (headless hosts, some cloud
/// deployments). Secrecy is delegated to file permissions.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
        }
    }

    fn load_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credential file")?;
        serde_json::from_str(&contents).context("Failed to parse credential file")
    }

    fn store_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents).context("Failed to write credential file")
    }
}

impl CredentialStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.load_map()?;
        map.insert(key.to_string(), value.to_string());
        self.store_map(&map)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.load_map()?;
        if map.remove(key).is_some() {
            self.store_map(&map)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Ephemeral credential storage; nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .map
            .read()
            .expect("credential map lock poisoned")
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .write()
            .expect("credential map lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map
            .write()
            .expect("credential map lock poisoned")
            .remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// Pick the best available backend: keychain if a probe round-trip
/// succeeds, otherwise the file fallback under `cache_dir`.
pub fn detect_storage(cache_dir: PathBuf) -> Box<dyn CredentialStorage> {
    let keyring = KeyringStorage::new();
    let probe = keyring
        .set(PROBE_KEY, "ok")
        .and_then(|_| keyring.get(PROBE_KEY))
        .and_then(|value| {
            keyring.delete(PROBE_KEY)?;
            Ok(value)
        });

    match probe {
        Ok(Some(_)) => {
            debug!("Using OS keychain for credential storage");
            Box::new(keyring)
        }
        Ok(None) | Err(_) => {
            debug!(path = %cache_dir.display(), "Keychain unavailable, using file credential storage");
            Box::new(FileStorage::new(cache_dir))
        }
    }
}
