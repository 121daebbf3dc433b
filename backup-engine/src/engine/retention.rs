//! Age-based retention.

use chrono::{DateTime, Duration, Utc};

use crate::catalog::BackupRecord;
use crate::config::RetentionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Backups older than this many days are pruned
    pub retention_days: u32,
    /// Newest backups that are never pruned, regardless of age
    pub keep_last: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            keep_last: None,
        }
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            keep_last: config.keep_last,
        }
    }
}

/// Outcome of a prune pass
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    /// (identifier, error message) for backups that could not be deleted
    pub failed: Vec<(String, String)>,
    pub bytes_freed: u64,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pick the records `policy` expires as of `now`.
///
/// `records` must be ordered newest first, as returned by the catalog.
pub fn select_expired(
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<BackupRecord> {
    // A period reaching past the earliest representable time expires nothing
    let Some(cutoff) = now.checked_sub_signed(Duration::days(i64::from(policy.retention_days)))
    else {
        return Vec::new();
    };
    let protected = policy.keep_last.unwrap_or(0);

    records
        .iter()
        .skip(protected)
        .filter(|r| r.created_at < cutoff)
        .cloned()
        .collect()
}
