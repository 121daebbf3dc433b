//! Backup engine for the workspace cleanup utility.
//!
//! Snapshots a directory tree into a verifiable, optionally encrypted
//! archive, keeps a durable catalog of snapshots, and restores them. Also
//! hosts the background resource monitor.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod fs;
pub mod monitor;
pub mod utils;

// Re-export commonly used types
pub use archive::{ArchiveCodec, ZstdTarCodec};
pub use catalog::{BackupCatalog, BackupRecord};
pub use config::Config;
pub use crypto::{EncryptionProvider, KeyStore};
pub use engine::{BackupEngine, CreateBackupRequest, PruneReport, RetentionPolicy};
pub use monitor::{MonitorConfig, MonitorHandle, MonitorState};
pub use utils::errors::{BackupError, ErrorKind, Result};
