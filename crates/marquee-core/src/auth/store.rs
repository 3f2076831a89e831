use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

/// The three keys a session persists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// Bearer token attached to API requests
    Access,
    /// Token exchanged for a new access token
    Refresh,
    /// JSON-serialized `UserRecord`
    User,
}

impl StorageKey {
    pub const ALL: [StorageKey; 3] = [StorageKey::Access, StorageKey::Refresh, StorageKey::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::Access => "access",
            StorageKey::Refresh => "refresh",
            StorageKey::User => "user",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "access" => Some(StorageKey::Access),
            "refresh" => Some(StorageKey::Refresh),
            "user" => Some(StorageKey::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted key/value storage for session credentials.
///
/// Implementations must be safe to share between the session manager, its
/// revalidation task and the HTTP client.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: StorageKey) -> Result<Option<String>>;

    fn set(&self, key: StorageKey, value: &str) -> Result<()>;

    fn remove(&self, key: StorageKey) -> Result<()>;

    /// Remove every session key, attempting all of them even if one fails
    fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in StorageKey::ALL {
            if let Err(e) = self.remove(key) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Credentials held in process memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StorageKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StorageKey, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: StorageKey) -> Result<Option<String>> {
        Ok(self.lock().get(&key).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        self.lock().insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: StorageKey) -> Result<()> {
        self.lock().remove(&key);
        Ok(())
    }
}
