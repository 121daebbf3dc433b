//! Backup catalog: what backups exist and where their archives live.

pub mod record;
pub mod store;

pub use record::BackupRecord;
pub use store::BackupCatalog;
