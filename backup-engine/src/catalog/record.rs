use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for one completed backup. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    /// Absolute source directory at the time of backup
    pub source_path: PathBuf,
    /// Archive file in the backup store
    pub storage_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Lowercase hex SHA-256 of the stored bytes
    pub checksum: String,
    pub size_bytes: u64,
    pub encrypted: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_count: usize,
}

impl BackupRecord {
    /// Ordering used by listings: newest first, then by id.
    pub fn newest_first(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}
