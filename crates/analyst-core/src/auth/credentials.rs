use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use keyring::Entry;
use tracing::{debug, warn};

use crate::auth::AccessToken;
use crate::error::{Result, SessionError};

/// Keyring service name for the keyring-backed store
const SERVICE_NAME: &str = "analyst-workspace";

/// Credential file name in the cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Fixed keys under which the session is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
    User,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 3] = [
        CredentialKey::AccessToken,
        CredentialKey::RefreshToken,
        CredentialKey::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::AccessToken => "accessToken",
            CredentialKey::RefreshToken => "refreshToken",
            CredentialKey::User => "user",
        }
    }
}

/// Durable key/value persistence for the session credentials.
///
/// Backends only move strings around. The access-token shape check lives in
/// the provided `set`, so no backend can persist a malformed token.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Result<Option<String>>;

    /// Raw write, bypassing validation. Call `set` instead.
    fn put(&self, key: CredentialKey, value: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn set(&self, key: CredentialKey, value: &str) -> Result<()> {
        if key == CredentialKey::AccessToken {
            AccessToken::parse(value)?;
        }
        self.put(key, value)
    }
}

/// In-process store, used for ephemeral sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CredentialKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SessionError::Storage("memory store lock poisoned".into()))?;
        Ok(entries.get(&key).cloned())
    }

    fn put(&self, key: CredentialKey, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SessionError::Storage("memory store lock poisoned".into()))?;
        entries.insert(key, value.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SessionError::Storage("memory store lock poisoned".into()))?;
        entries.clear();
        Ok(())
    }
}

/// JSON file in the cache directory holding all three entries.
///
/// Every write replaces the whole file through a temp file and rename, so a
/// reader never observes a half-written token.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(CREDENTIALS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| SessionError::Storage(format!("Failed to read credential file: {}", e)))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents)
            .map_err(|e| SessionError::Storage(format!("Failed to parse credential file: {}", e)))
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionError::Storage(format!("Failed to create cache dir: {}", e)))?;
        }
        let contents = serde_json::to_string_pretty(entries)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .map_err(|e| SessionError::Storage(format!("Failed to write credential file: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SessionError::Storage(format!("Failed to replace credential file: {}", e)))?;
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| SessionError::Storage("file store lock poisoned".into()))
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.read_all()?.remove(key.as_str()))
    }

    fn put(&self, key: CredentialKey, value: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut entries = self.read_all()?;
        entries.insert(key.as_str().to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.guard()?;
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| {
                SessionError::Storage(format!("Failed to delete credential file: {}", e))
            })?;
            debug!(path = ?self.path, "Credential file removed");
        }
        Ok(())
    }
}

/// OS keychain store, one entry per key.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self, key: CredentialKey) -> Result<Entry> {
        Entry::new(&self.service, key.as_str())
            .map_err(|e| SessionError::Storage(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SessionError::Storage(format!(
                "Failed to retrieve {} from keychain: {}",
                key.as_str(),
                e
            ))),
        }
    }

    fn put(&self, key: CredentialKey, value: &str) -> Result<()> {
        self.entry(key)?.set_password(value).map_err(|e| {
            SessionError::Storage(format!("Failed to store {} in keychain: {}", key.as_str(), e))
        })
    }

    fn clear(&self) -> Result<()> {
        for key in CredentialKey::ALL {
            match self.entry(key)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "Failed to delete keychain entry");
                    return Err(SessionError::Storage(e.to_string()));
                }
            }
        }
        Ok(())
    }
}
