//! Custom error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`BackupError`], used by callers to decide
/// how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    NotFound,
    IntegrityFailure,
    Security,
    Conflict,
    Io,
    Internal,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Archive for backup {id} is missing at {}", path.display())]
    ArchiveMissing { id: String, path: PathBuf },

    #[error("Integrity check failed for backup {id}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid archive entry: {0}")]
    InvalidArchiveEntry(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Decryption failed: invalid key or corrupted data")]
    DecryptionFailed,

    #[error("Invalid ciphertext: {len} bytes is shorter than the {min}-byte nonce")]
    InvalidCiphertext { len: usize, min: usize },

    #[error("Duplicate backup identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Another operation is in progress for backup {0}")]
    OperationInProgress(String),

    #[error("Restore of backup {id} to {} failed: {source}", destination.display())]
    RestoreFailed {
        id: String,
        destination: PathBuf,
        #[source]
        source: Box<BackupError>,
    },

    #[error("I/O error at {}: {source}", path.display())]
    IoAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalog is corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl BackupError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAccess {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath(_) | Self::Config(_) => ErrorKind::InputValidation,
            Self::SourceNotFound(_) | Self::BackupNotFound(_) | Self::ArchiveMissing { .. } => {
                ErrorKind::NotFound
            }
            Self::IntegrityCheckFailed { .. }
            | Self::InvalidArchiveEntry(_)
            | Self::CorruptArchive(_)
            | Self::CatalogCorrupt(_) => ErrorKind::IntegrityFailure,
            Self::KeyUnavailable(_) | Self::DecryptionFailed | Self::InvalidCiphertext { .. } => {
                ErrorKind::Security
            }
            Self::DuplicateIdentifier(_) | Self::OperationInProgress(_) => ErrorKind::Conflict,
            Self::IoAccess { .. } => ErrorKind::Io,
            Self::RestoreFailed { source, .. } => source.kind(),
            Self::Task(_) => ErrorKind::Internal,
        }
    }

    /// Innermost error, looking through `RestoreFailed` wrappers.
    pub fn root_cause(&self) -> &BackupError {
        match self {
            Self::RestoreFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackupError::BackupNotFound("abc".into());
        assert_eq!(err.to_string(), "Backup not found: abc");
    }

    #[test]
    fn test_kind_taxonomy() {
        assert_eq!(BackupError::InvalidPath("".into()).kind(), ErrorKind::InputValidation);
        assert_eq!(BackupError::DecryptionFailed.kind(), ErrorKind::Security);
        assert_eq!(
            BackupError::DuplicateIdentifier("x".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            BackupError::CorruptArchive("bad magic".into()).kind(),
            ErrorKind::IntegrityFailure
        );
    }

    #[test]
    fn test_restore_failed_keeps_cause() {
        let err = BackupError::RestoreFailed {
            id: "abc".into(),
            destination: PathBuf::from("/tmp/out"),
            source: Box::new(BackupError::DecryptionFailed),
        };
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(matches!(err.root_cause(), BackupError::DecryptionFailed));
        assert!(err.to_string().contains("abc"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_helper() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = BackupError::io("/data/file.txt", io_err);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("/data/file.txt"));
    }
}
