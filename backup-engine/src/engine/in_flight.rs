//! Tracks which backup identifiers have an operation running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::utils::{BackupError, Result};

/// Registry of identifiers with an in-flight create, restore, verify or delete.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for the lifetime of the returned guard.
    pub fn acquire(&self, id: &str) -> Result<InFlightGuard> {
        let mut ids = self
            .ids
            .lock()
            .map_err(|_| BackupError::Task("in-flight registry poisoned".to_string()))?;

        if !ids.insert(id.to_string()) {
            return Err(BackupError::OperationInProgress(id.to_string()));
        }

        Ok(InFlightGuard {
            ids: self.ids.clone(),
            id: id.to_string(),
        })
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.ids.lock().map(|ids| ids.contains(id)).unwrap_or(false)
    }

    /// Get count of running operations
    pub fn running_count(&self) -> usize {
        self.ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }
}

/// Releases its identifier on drop, including on early returns and panics.
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // A poisoned set still holds our id; clear it anyway
        let mut ids = match self.ids.lock() {
            Ok(ids) => ids,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_conflicts() {
        let registry = InFlightRegistry::new();
        let guard = registry.acquire("abc").unwrap();
        assert_eq!(guard.id(), "abc");

        let result = registry.acquire("abc");
        assert!(matches!(result, Err(BackupError::OperationInProgress(id)) if id == "abc"));

        // Other ids are independent
        let _other = registry.acquire("def").unwrap();
        assert_eq!(registry.running_count(), 2);
    }

    #[test]
    fn test_drop_releases() {
        let registry = InFlightRegistry::new();
        {
            let _guard = registry.acquire("abc").unwrap();
            assert!(registry.is_active("abc"));
        }
        assert!(!registry.is_active("abc"));
        assert!(registry.acquire("abc").is_ok());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = InFlightRegistry::new();
        let clone = registry.clone();
        let _guard = registry.acquire("shared").unwrap();
        assert!(clone.acquire("shared").is_err());
    }
}
