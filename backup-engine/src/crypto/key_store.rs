//! Key storage backends.
//!
//! The provider only talks to [`KeyStore`]; which backend sits behind it is
//! a configuration choice:
//! - `file`: base64 key in a private file under the data directory
//! - `keychain`: platform credential store through the `keyring` crate
//!   (Keychain Services, Windows Credential Manager, Linux keyutils)
//! - `memory`: process-local, for tests and throwaway runs

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::EncryptionKey;
use crate::utils::{BackupError, Result};

/// Capability for fetching and storing the installation key.
pub trait KeyStore: Send + Sync {
    /// Fetch the stored key, `Ok(None)` if nothing has been stored yet.
    fn get_key(&self) -> Result<Option<EncryptionKey>>;

    /// Store `key`, replacing any previous one.
    fn put_key(&self, key: &EncryptionKey) -> Result<()>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Process-local key store
#[derive(Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<EncryptionKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: EncryptionKey) -> Self {
        Self {
            key: Mutex::new(Some(key)),
        }
    }

    /// Drop the stored key
    pub fn clear(&self) {
        if let Ok(mut slot) = self.key.lock() {
            *slot = None;
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_key(&self) -> Result<Option<EncryptionKey>> {
        let slot = self
            .key
            .lock()
            .map_err(|_| BackupError::KeyUnavailable("memory key store poisoned".to_string()))?;
        Ok(slot.clone())
    }

    fn put_key(&self, key: &EncryptionKey) -> Result<()> {
        let mut slot = self
            .key
            .lock()
            .map_err(|_| BackupError::KeyUnavailable("memory key store poisoned".to_string()))?;
        *slot = Some(key.clone());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Key kept as base64 in a file readable only by the owner (on unix).
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn get_key(&self) -> Result<Option<EncryptionKey>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => EncryptionKey::from_base64(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::KeyUnavailable(format!(
                "cannot read key file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn put_key(&self, key: &EncryptionKey) -> Result<()> {
        let unavailable = |what: &str, e: std::io::Error| {
            BackupError::KeyUnavailable(format!("{} {}: {}", what, self.path.display(), e))
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| unavailable("cannot create directory for", e))?;
        }

        let temp_path = self.path.with_extension("key.tmp");
        let mut file = private_file(&temp_path).map_err(|e| unavailable("cannot create", e))?;
        file.write_all(key.to_base64().as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| unavailable("cannot write", e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            unavailable("cannot replace", e)
        })?;

        tracing::debug!(path = %self.path.display(), "Stored encryption key");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

#[cfg(unix)]
fn private_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Key kept in the platform credential store.
pub struct KeychainKeyStore {
    service: String,
    account: String,
}

impl KeychainKeyStore {
    pub const DEFAULT_SERVICE: &'static str = "workspace-cleanup";
    pub const DEFAULT_ACCOUNT: &'static str = "backup-encryption-key";

    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| BackupError::KeyUnavailable(format!("keychain entry creation: {}", e)))
    }
}

impl Default for KeychainKeyStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SERVICE, Self::DEFAULT_ACCOUNT)
    }
}

impl KeyStore for KeychainKeyStore {
    fn get_key(&self) -> Result<Option<EncryptionKey>> {
        match self.entry()?.get_password() {
            Ok(encoded) => EncryptionKey::from_base64(&encoded).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(BackupError::KeyUnavailable(format!(
                "keychain get for '{}': {}",
                self.account, e
            ))),
        }
    }

    fn put_key(&self, key: &EncryptionKey) -> Result<()> {
        self.entry()?
            .set_password(&key.to_base64())
            .map_err(|e| {
                BackupError::KeyUnavailable(format!("keychain store for '{}': {}", self.account, e))
            })?;
        tracing::debug!(account = %self.account, "Stored encryption key in platform keychain");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "keychain"
    }
}
