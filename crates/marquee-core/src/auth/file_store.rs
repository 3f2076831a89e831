use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::crypto::StoreCipher;
use super::store::{CredentialStore, StorageKey};

/// Credential file name when stored as plain JSON
const PLAIN_FILE: &str = "credentials.json";

/// Credential file name when sealed with a `StoreCipher`
const SEALED_FILE: &str = "credentials.bin";

/// Credentials persisted to a single file, optionally encrypted.
///
/// The whole map is rewritten on every mutation so the file always reflects
/// the last successful write. A file that cannot be read or decrypted is
/// treated as an empty store.
pub struct FileStore {
    path: PathBuf,
    cipher: Option<StoreCipher>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or start) a plain JSON store in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_at(dir.join(PLAIN_FILE), None)
    }

    /// Open (or start) an encrypted store in `dir`
    pub fn open_encrypted(dir: &Path, cipher: StoreCipher) -> Result<Self> {
        Self::open_at(dir.join(SEALED_FILE), Some(cipher))
    }

    fn open_at(path: PathBuf, cipher: Option<StoreCipher>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create credential directory {}", parent.display()))?;
        }
        let entries = Self::read_entries(&path, cipher.as_ref());
        debug!(path = %path.display(), keys = entries.len(), encrypted = cipher.is_some(), "Credential store opened");
        Ok(Self {
            path,
            cipher,
            entries: Mutex::new(entries),
        })
    }

    fn read_entries(path: &Path, cipher: Option<&StoreCipher>) -> BTreeMap<String, String> {
        if !path.exists() {
            return BTreeMap::new();
        }
        match Self::try_read(path, cipher) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "Ignoring unreadable credential file");
                BTreeMap::new()
            }
        }
    }

    fn try_read(path: &Path, cipher: Option<&StoreCipher>) -> Result<BTreeMap<String, String>> {
        let raw = std::fs::read(path).context("Failed to read credential file")?;
        let contents = match cipher {
            Some(cipher) => cipher.open(&raw)?,
            None => raw,
        };
        let mut entries: BTreeMap<String, String> =
            serde_json::from_slice(&contents).context("Failed to parse credential file")?;
        entries.retain(|name, _| StorageKey::from_name(name).is_some());
        Ok(entries)
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let contents = match self.cipher {
            Some(ref cipher) => cipher.seal(&json)?,
            None => json,
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).context("Failed to write credential file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path).context("Failed to replace credential file")?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `change` to a copy, persist it, and only then make it current
    fn update(&self, change: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut entries = self.lock();
        let mut next = entries.clone();
        change(&mut next);
        if next == *entries {
            return Ok(());
        }
        self.write_entries(&next)?;
        *entries = next;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: StorageKey) -> Result<Option<String>> {
        Ok(self.lock().get(key.as_str()).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.as_str().to_string(), value.to_string());
        })
    }

    fn remove(&self, key: StorageKey) -> Result<()> {
        self.update(|entries| {
            entries.remove(key.as_str());
        })
    }

    fn clear(&self) -> Result<()> {
        self.update(|entries| entries.clear())
    }
}
