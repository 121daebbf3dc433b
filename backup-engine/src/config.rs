//! Configuration for the backup engine and its host.
//!
//! Loaded from a TOML file; every section and field has a default, so an
//! empty file (or no file) gives a working setup under the platform data
//! directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::DEFAULT_COMPRESSION_LEVEL;
use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub retention: RetentionConfig,
    pub monitor: MonitorSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persisted-state directory (catalog, backup store, key file)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// zstd level (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// File or directory names never packed
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreKind {
    File,
    Keychain,
    Memory,
}

impl std::str::FromStr for KeyStoreKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keychain" => Ok(Self::Keychain),
            "memory" => Ok(Self::Memory),
            other => Err(BackupError::Config(format!("unknown key store '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt new backups unless the request says otherwise
    #[serde(default = "default_true")]
    pub encrypt_by_default: bool,

    #[serde(default = "default_key_store")]
    pub key_store: KeyStoreKind,

    /// Key file location for the `file` backend (default `<data_dir>/backup.key`)
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Service name for the `keychain` backend
    #[serde(default = "default_keychain_service")]
    pub keychain_service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Always keep this many newest backups regardless of age
    #[serde(default)]
    pub keep_last: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_percent: f32,

    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    /// Upper bound on the delay after repeated sampling errors
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "workspace-cleanup")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".workspace-cleanup"))
}

fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_true() -> bool {
    true
}

fn default_key_store() -> KeyStoreKind {
    KeyStoreKind::File
}

fn default_keychain_service() -> String {
    "workspace-cleanup".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_interval_secs() -> u64 {
    30
}

fn default_cpu_threshold() -> f32 {
    80.0
}

fn default_memory_threshold_mb() -> u64 {
    1024
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            compression_level: default_compression_level(),
            exclude: Vec::new(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            encrypt_by_default: true,
            key_store: default_key_store(),
            key_file: None,
            keychain_service: default_keychain_service(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            keep_last: None,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            cpu_threshold_percent: default_cpu_threshold(),
            memory_threshold_mb: default_memory_threshold_mb(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BackupError::io(path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.storage.compression_level) {
            return Err(BackupError::Config(format!(
                "compression_level must be 1-22, got {}",
                self.storage.compression_level
            )));
        }
        if self.monitor.interval_secs == 0 {
            return Err(BackupError::Config("monitor.interval_secs must be > 0".into()));
        }
        if !(0.0..=100.0).contains(&self.monitor.cpu_threshold_percent) {
            return Err(BackupError::Config(format!(
                "cpu_threshold_percent must be 0-100, got {}",
                self.monitor.cpu_threshold_percent
            )));
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.storage.data_dir.join("catalog.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.storage.data_dir.join("backups")
    }
}
