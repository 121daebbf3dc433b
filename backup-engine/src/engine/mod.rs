//! Backup engine - orchestrates archive packing, encryption, storage and
//! the catalog into create/restore and the maintenance operations.
//!
//! Every operation claims its backup identifier in an in-flight registry,
//! so a restore can never observe a half-written archive and two deletes
//! of the same backup cannot interleave. Blocking work (packing, cipher,
//! hashing, archive IO) runs on tokio's blocking pool.
//!
//! Create is all-or-nothing: on any failure after packing starts, the
//! partial and final archive files are removed before the error is
//! returned. Restore performs no rollback of files already extracted when
//! a later entry fails; the error names the destination so the caller can
//! clean up.

pub mod in_flight;
pub mod retention;

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveCodec, UnpackSummary, ZstdTarCodec};
use crate::catalog::{BackupCatalog, BackupRecord};
use crate::config::Config;
use crate::crypto::{build_key_store, EncryptionProvider};
use crate::utils::{BackupError, Result};

pub use in_flight::{InFlightGuard, InFlightRegistry};
pub use retention::{select_expired, PruneReport, RetentionPolicy};

/// Extension of archive files in the backup store
pub const ARCHIVE_EXTENSION: &str = "wcbk";

/// Input to [`BackupEngine::create_backup`]
#[derive(Debug, Clone)]
pub struct CreateBackupRequest {
    pub source_path: PathBuf,
    pub description: String,
    /// Encrypt the stored archive
    pub encrypt: bool,
}

impl CreateBackupRequest {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            description: String::new(),
            encrypt: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn encrypted(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }
}

/// A catalog record whose archive is not usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIssue {
    pub id: String,
    pub storage_path: PathBuf,
    pub problem: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    ArchiveMissing,
    Unreadable(String),
    SizeMismatch { expected: u64, actual: u64 },
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArchiveMissing => write!(f, "archive file is missing"),
            Self::Unreadable(reason) => write!(f, "archive is unreadable: {}", reason),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "archive is {} bytes, catalog says {}", actual, expected)
            }
        }
    }
}

pub struct BackupEngine {
    codec: Arc<dyn ArchiveCodec>,
    crypto: Arc<EncryptionProvider>,
    catalog: Arc<BackupCatalog>,
    store_dir: PathBuf,
    in_flight: InFlightRegistry,
}

impl BackupEngine {
    pub fn new(
        codec: Arc<dyn ArchiveCodec>,
        crypto: Arc<EncryptionProvider>,
        catalog: Arc<BackupCatalog>,
        store_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            codec,
            crypto,
            catalog,
            store_dir: store_dir.into(),
            in_flight: InFlightRegistry::new(),
        }
    }

    /// Wire the default collaborators from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let codec = ZstdTarCodec::new(config.storage.compression_level)
            .with_excludes(config.storage.exclude.clone());
        let key_store = build_key_store(&config.encryption, &config.storage.data_dir);
        let catalog = BackupCatalog::open(config.catalog_path()).await?;

        info!(
            data_dir = %config.storage.data_dir.display(),
            key_store = key_store.backend(),
            "Backup engine ready"
        );

        Ok(Self::new(
            Arc::new(codec),
            Arc::new(EncryptionProvider::new(key_store)),
            Arc::new(catalog),
            config.backup_dir(),
        ))
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Snapshot `request.source_path` into the store and record it.
    /// Returns the new backup identifier.
    pub async fn create_backup(&self, request: CreateBackupRequest) -> Result<String> {
        if request.source_path.as_os_str().is_empty() {
            return Err(BackupError::InvalidPath("source path is empty".to_string()));
        }

        let source = match tokio::fs::canonicalize(&request.source_path).await {
            Ok(path) => path,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::SourceNotFound(request.source_path))
            }
            Err(e) => return Err(BackupError::io(&request.source_path, e)),
        };

        let id = Uuid::new_v4().to_string();
        let _guard = self.in_flight.acquire(&id)?;
        if self.catalog.find(&id).await.is_some() {
            return Err(BackupError::DuplicateIdentifier(id));
        }

        let storage_path = self.archive_path(&id);
        info!(backup_id = %id, source = %source.display(), encrypt = request.encrypt, "Creating backup");

        match self.write_backup(&id, &source, &storage_path, &request).await {
            Ok(record) => {
                info!(
                    backup_id = %id,
                    bytes = record.size_bytes,
                    files = record.file_count,
                    "Backup created"
                );
                Ok(id)
            }
            Err(e) => {
                error!(backup_id = %id, source = %source.display(), "Backup failed: {}", e);
                discard_archive(&storage_path).await;
                Err(e)
            }
        }
    }

    async fn write_backup(
        &self,
        id: &str,
        source: &Path,
        storage_path: &Path,
        request: &CreateBackupRequest,
    ) -> Result<BackupRecord> {
        let codec = self.codec.clone();
        let crypto = self.crypto.clone();
        let encrypt = request.encrypt;
        let source_owned = source.to_path_buf();
        let target = storage_path.to_path_buf();

        let (checksum, size_bytes, file_count) = tokio::task::spawn_blocking(move || {
            let packed = codec.pack(&source_owned)?;
            let file_count = packed.file_count;

            let stored = if encrypt {
                crypto.encrypt(&packed.bytes)?
            } else {
                packed.bytes
            };

            let checksum = sha256_hex(&stored);
            write_archive_file(&target, &stored)?;
            Ok::<_, BackupError>((checksum, stored.len() as u64, file_count))
        })
        .await??;

        let record = BackupRecord {
            id: id.to_string(),
            source_path: source.to_path_buf(),
            storage_path: storage_path.to_path_buf(),
            created_at: Utc::now(),
            checksum,
            size_bytes,
            encrypted: request.encrypt,
            description: request.description.clone(),
            file_count,
        };

        self.catalog.append(record.clone()).await?;
        Ok(record)
    }

    /// Extract backup `id` into `destination`.
    ///
    /// The archive is checked against the catalog checksum before anything
    /// is written. Failures after lookup are wrapped in
    /// [`BackupError::RestoreFailed`] carrying the id and destination.
    pub async fn restore_backup(&self, id: &str, destination: &Path) -> Result<UnpackSummary> {
        if destination.as_os_str().is_empty() {
            return Err(BackupError::InvalidPath("destination path is empty".to_string()));
        }

        let _guard = self.in_flight.acquire(id)?;
        let record = self
            .catalog
            .find(id)
            .await
            .ok_or_else(|| BackupError::BackupNotFound(id.to_string()))?;

        info!(backup_id = %id, destination = %destination.display(), "Restoring backup");

        let result = self.extract(&record, destination).await;
        match result {
            Ok(summary) => {
                info!(
                    backup_id = %id,
                    destination = %destination.display(),
                    files = summary.files_written,
                    bytes = summary.bytes_written,
                    "Backup restored"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(backup_id = %id, destination = %destination.display(), "Restore failed: {}", e);
                Err(BackupError::RestoreFailed {
                    id: id.to_string(),
                    destination: destination.to_path_buf(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn extract(&self, record: &BackupRecord, destination: &Path) -> Result<UnpackSummary> {
        let stored = read_verified(record).await?;

        let codec = self.codec.clone();
        let crypto = self.crypto.clone();
        let encrypted = record.encrypted;
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let container = if encrypted {
                crypto.decrypt(&stored)?
            } else {
                stored
            };
            codec.unpack(&container, &destination)
        })
        .await?
    }

    /// Check that backup `id`'s archive exists and matches its checksum.
    pub async fn verify_backup(&self, id: &str) -> Result<BackupRecord> {
        let _guard = self.in_flight.acquire(id)?;
        let record = self
            .catalog
            .find(id)
            .await
            .ok_or_else(|| BackupError::BackupNotFound(id.to_string()))?;

        read_verified(&record).await?;
        info!(backup_id = %id, "Backup verified");
        Ok(record)
    }

    /// Delete backup `id`: archive file first, then the catalog record.
    pub async fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        let _guard = self.in_flight.acquire(id)?;
        let record = self
            .catalog
            .find(id)
            .await
            .ok_or_else(|| BackupError::BackupNotFound(id.to_string()))?;

        match tokio::fs::remove_file(&record.storage_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backup_id = %id, path = %record.storage_path.display(), "Archive already gone");
            }
            Err(e) => return Err(BackupError::io(&record.storage_path, e)),
        }

        self.catalog.remove(id).await?;
        info!(backup_id = %id, "Backup deleted");
        Ok(record)
    }

    /// Delete every backup the policy expires. Individual failures are
    /// collected in the report instead of stopping the pass.
    pub async fn prune_backups(&self, policy: &RetentionPolicy) -> PruneReport {
        let records = self.catalog.list().await;
        let expired = select_expired(&records, policy, Utc::now());
        let mut report = PruneReport::default();

        for record in expired {
            match self.delete_backup(&record.id).await {
                Ok(deleted) => {
                    report.bytes_freed += deleted.size_bytes;
                    report.deleted.push(deleted.id);
                }
                Err(e) => {
                    warn!(backup_id = %record.id, "Failed to prune backup: {}", e);
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            bytes = report.bytes_freed,
            "Prune complete"
        );
        report
    }

    /// Report every record whose archive is missing or unusable. Nothing is
    /// removed from the catalog.
    pub async fn audit_catalog(&self) -> Vec<CatalogIssue> {
        let mut issues = Vec::new();

        for record in self.catalog.list().await {
            let problem = match tokio::fs::metadata(&record.storage_path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(IssueKind::ArchiveMissing),
                Err(e) => Some(IssueKind::Unreadable(e.to_string())),
                Ok(meta) if !meta.is_file() => {
                    Some(IssueKind::Unreadable("not a regular file".to_string()))
                }
                Ok(meta) if meta.len() != record.size_bytes => Some(IssueKind::SizeMismatch {
                    expected: record.size_bytes,
                    actual: meta.len(),
                }),
                Ok(_) => match tokio::fs::File::open(&record.storage_path).await {
                    Ok(_) => None,
                    Err(e) => Some(IssueKind::Unreadable(e.to_string())),
                },
            };

            if let Some(problem) = problem {
                warn!(backup_id = %record.id, "Catalog record is corrupt: {}", problem);
                issues.push(CatalogIssue {
                    id: record.id,
                    storage_path: record.storage_path,
                    problem,
                });
            }
        }

        issues
    }

    pub async fn list_backups(&self) -> Vec<BackupRecord> {
        self.catalog.list().await
    }

    pub async fn find_backup(&self, id: &str) -> Option<BackupRecord> {
        self.catalog.find(id).await
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.store_dir.join(format!("{}.{}", id, ARCHIVE_EXTENSION))
    }
}

/// Read a record's archive and check it against the catalog checksum.
async fn read_verified(record: &BackupRecord) -> Result<Vec<u8>> {
    let stored = match tokio::fs::read(&record.storage_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::ArchiveMissing {
                id: record.id.clone(),
                path: record.storage_path.clone(),
            })
        }
        Err(e) => return Err(BackupError::io(&record.storage_path, e)),
    };

    let (stored, actual) = tokio::task::spawn_blocking(move || {
        let checksum = sha256_hex(&stored);
        (stored, checksum)
    })
    .await?;

    if actual != record.checksum {
        return Err(BackupError::IntegrityCheckFailed {
            id: record.id.clone(),
            expected: record.checksum.clone(),
            actual,
        });
    }

    Ok(stored)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Write `bytes` to `<path>.partial`, fsync, then rename into place.
fn write_archive_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }

    let partial = partial_path(path);
    let mut file = File::create(&partial).map_err(|e| BackupError::io(&partial, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| BackupError::io(&partial, e))?;
    drop(file);

    std::fs::rename(&partial, path).map_err(|e| BackupError::io(path, e))
}

/// Remove whatever a failed create left behind
async fn discard_archive(path: &Path) {
    for leftover in [partial_path(path), path.to_path_buf()] {
        match tokio::fs::remove_file(&leftover).await {
            Ok(()) => info!(path = %leftover.display(), "Removed incomplete archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %leftover.display(), "Failed to remove incomplete archive: {}", e),
        }
    }
}
