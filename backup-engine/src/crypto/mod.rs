//! Archive encryption and key management.

pub mod key;
pub mod key_store;
pub mod provider;

use std::path::Path;
use std::sync::Arc;

pub use key::EncryptionKey;
pub use key_store::{FileKeyStore, KeyStore, KeychainKeyStore, MemoryKeyStore};
pub use provider::EncryptionProvider;

use crate::config::{EncryptionConfig, KeyStoreKind};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Build the configured key store backend.
pub fn build_key_store(config: &EncryptionConfig, data_dir: &Path) -> Arc<dyn KeyStore> {
    match config.key_store {
        KeyStoreKind::File => {
            let path = config
                .key_file
                .clone()
                .unwrap_or_else(|| data_dir.join("backup.key"));
            Arc::new(FileKeyStore::new(path))
        }
        KeyStoreKind::Keychain => Arc::new(KeychainKeyStore::new(
            config.keychain_service.clone(),
            KeychainKeyStore::DEFAULT_ACCOUNT,
        )),
        KeyStoreKind::Memory => Arc::new(MemoryKeyStore::new()),
    }
}
