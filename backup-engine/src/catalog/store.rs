//! Durable catalog of backup records.
//!
//! The whole catalog is one JSON document rewritten on every mutation:
//! serialise to `<file>.tmp`, fsync, rename over the original. Readers
//! share a read lock; `append` and `remove` hold the write lock across the
//! rewrite and only swap in the changed list once it is on disk.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::BackupRecord;
use crate::utils::{BackupError, Result};

const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    records: Vec<BackupRecord>,
}

pub struct BackupCatalog {
    path: PathBuf,
    records: RwLock<Vec<BackupRecord>>,
}

impl BackupCatalog {
    /// Load the catalog at `path`. A missing file is an empty catalog.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => parse_document(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No catalog yet, starting empty");
                Vec::new()
            }
            Err(e) => return Err(BackupError::io(&path, e)),
        };

        tracing::info!(path = %path.display(), records = records.len(), "Catalog loaded");

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a record; fails if its id is already present.
    pub async fn append(&self, record: BackupRecord) -> Result<()> {
        let mut records = self.records.write().await;

        if records.iter().any(|r| r.id == record.id) {
            return Err(BackupError::DuplicateIdentifier(record.id));
        }

        let mut updated = records.clone();
        updated.push(record);
        self.persist(&updated).await?;
        *records = updated;

        Ok(())
    }

    pub async fn find(&self, id: &str) -> Option<BackupRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| r.id == id).cloned()
    }

    /// All records, most recent first.
    pub async fn list(&self) -> Vec<BackupRecord> {
        let mut records = self.records.read().await.clone();
        records.sort_by(BackupRecord::newest_first);
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Remove a record, returning it. `Ok(None)` if the id was not present.
    pub async fn remove(&self, id: &str) -> Result<Option<BackupRecord>> {
        let mut records = self.records.write().await;

        let Some(index) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };

        let mut updated = records.clone();
        let removed = updated.remove(index);
        self.persist(&updated).await?;
        *records = updated;

        Ok(Some(removed))
    }

    async fn persist(&self, records: &[BackupRecord]) -> Result<()> {
        let document = CatalogDocument {
            version: CATALOG_VERSION,
            records: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| BackupError::Task(format!("catalog serialization: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackupError::io(parent, e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &self.path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(BackupError::io(&self.path, e));
        }

        tracing::debug!(path = %self.path.display(), records = records.len(), "Catalog persisted");
        Ok(())
    }
}

fn parse_document(path: &Path, bytes: &[u8]) -> Result<Vec<BackupRecord>> {
    let document: CatalogDocument = serde_json::from_slice(bytes)
        .map_err(|e| BackupError::CatalogCorrupt(format!("{}: {}", path.display(), e)))?;

    if document.version != CATALOG_VERSION {
        return Err(BackupError::CatalogCorrupt(format!(
            "{}: unsupported catalog version {}",
            path.display(),
            document.version
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for record in &document.records {
        if !seen.insert(record.id.as_str()) {
            return Err(BackupError::CatalogCorrupt(format!(
                "{}: identifier {} appears more than once",
                path.display(),
                record.id
            )));
        }
    }

    Ok(document.records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn record(id: &str, minutes: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            source_path: PathBuf::from("/work/project"),
            storage_path: PathBuf::from(format!("/data/backups/{}.wcbk", id)),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + Duration::minutes(minutes),
            checksum: "ab".repeat(32),
            size_bytes: 128,
            encrypted: false,
            description: String::new(),
            file_count: 2,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_catalog() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::open(dir.path().join("catalog.json")).await.unwrap();
        assert!(catalog.is_empty().await);
        assert!(catalog.find("anything").await.is_none());
    }

    #[tokio::test]
    async fn test_append_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/catalog.json");

        let catalog = BackupCatalog::open(&path).await.unwrap();
        catalog.append(record("one", 0)).await.unwrap();
        catalog.append(record("two", 1)).await.unwrap();
        assert!(!dir.path().join("state/catalog.json.tmp").exists());

        let reopened = BackupCatalog::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.find("one").await.unwrap(), record("one", 0));
    }

    #[tokio::test]
    async fn test_duplicate_identifier_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::open(dir.path().join("catalog.json")).await.unwrap();

        catalog.append(record("dup", 0)).await.unwrap();
        let result = catalog.append(record("dup", 5)).await;
        assert!(matches!(result, Err(BackupError::DuplicateIdentifier(id)) if id == "dup"));
        assert_eq!(catalog.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_id_tiebreak() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::open(dir.path().join("catalog.json")).await.unwrap();

        catalog.append(record("old", 0)).await.unwrap();
        catalog.append(record("tie-b", 10)).await.unwrap();
        catalog.append(record("newest", 20)).await.unwrap();
        catalog.append(record("tie-a", 10)).await.unwrap();

        let ids: Vec<String> = catalog.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["newest", "tie-a", "tie-b", "old"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = BackupCatalog::open(&path).await.unwrap();

        catalog.append(record("keep", 0)).await.unwrap();
        catalog.append(record("drop", 1)).await.unwrap();

        let removed = catalog.remove("drop").await.unwrap();
        assert_eq!(removed.map(|r| r.id), Some("drop".to_string()));
        assert!(catalog.find("drop").await.is_none());
        assert!(catalog.remove("drop").await.unwrap().is_none());

        let reopened = BackupCatalog::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.find("keep").await.is_some());
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let catalog = BackupCatalog::open(state_dir.join("catalog.json")).await.unwrap();

        // State directory replaced by a regular file, so every write fails
        std::fs::write(&state_dir, b"").unwrap();
        let result = catalog.append(record("lost", 0)).await;
        assert!(matches!(result, Err(BackupError::IoAccess { .. })));
        assert!(catalog.find("lost").await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_append_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/catalog.json");
        let catalog = BackupCatalog::open(&path).await.unwrap();
        catalog.append(record("first", 0)).await.unwrap();

        // Dropped at the first await inside the rewrite
        let result = tokio::time::timeout(
            std::time::Duration::ZERO,
            catalog.append(record("dropped", 1)),
        )
        .await;

        match result {
            Err(_) => {
                assert!(catalog.find("dropped").await.is_none());
                assert_eq!(catalog.len().await, 1);
            }
            Ok(appended) => appended.unwrap(),
        }

        // The catalog stays usable after the cancelled call
        catalog.append(record("second", 2)).await.unwrap();
        let reopened = BackupCatalog::open(&path).await.unwrap();
        assert!(reopened.find("second").await.is_some());
        assert_eq!(reopened.len().await, catalog.len().await);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = BackupCatalog::open(&path).await;
        assert!(matches!(result, Err(BackupError::CatalogCorrupt(_))));
        // Left as-is for inspection
        assert_eq!(std::fs::read(&path).unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn test_duplicate_ids_on_disk_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let document = CatalogDocument {
            version: CATALOG_VERSION,
            records: vec![record("same", 0), record("same", 1)],
        };
        std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

        let result = BackupCatalog::open(&path).await;
        assert!(matches!(result, Err(BackupError::CatalogCorrupt(_))));
    }
}
