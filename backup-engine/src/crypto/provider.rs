use std::sync::{Arc, Mutex};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

use super::{EncryptionKey, KeyStore, NONCE_SIZE};
use crate::utils::{BackupError, Result};

/// AES-256-GCM wrapper over a pluggable [`KeyStore`].
///
/// Output of [`encrypt`](Self::encrypt) is `[nonce (12 bytes)][ciphertext + tag]`,
/// so a payload can be decrypted with nothing but the key.
pub struct EncryptionProvider {
    store: Arc<dyn KeyStore>,
    // Serialises first-use key generation
    generate_lock: Mutex<()>,
}

impl EncryptionProvider {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            generate_lock: Mutex::new(()),
        }
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Encrypt `plaintext` under the installation key, creating the key on
    /// first use.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.active_key()?;
        let cipher = cipher_for(&key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| BackupError::Task("AES-GCM encryption failed".to_string()))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_SIZE {
            return Err(BackupError::InvalidCiphertext {
                len: payload.len(),
                min: NONCE_SIZE,
            });
        }

        let key = self.store.get_key()?.ok_or_else(|| {
            BackupError::KeyUnavailable(format!(
                "no key in {} key store",
                self.store.backend()
            ))
        })?;
        let cipher = cipher_for(&key)?;

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BackupError::DecryptionFailed)
    }

    fn active_key(&self) -> Result<EncryptionKey> {
        if let Some(key) = self.store.get_key()? {
            return Ok(key);
        }

        let _guard = self
            .generate_lock
            .lock()
            .map_err(|_| BackupError::KeyUnavailable("key generation lock poisoned".to_string()))?;

        // Another caller may have stored one while we waited
        if let Some(key) = self.store.get_key()? {
            return Ok(key);
        }

        let key = EncryptionKey::generate();
        self.store.put_key(&key)?;
        tracing::info!(backend = self.store.backend(), "Generated new backup encryption key");
        Ok(key)
    }
}

fn cipher_for(key: &EncryptionKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| BackupError::KeyUnavailable(format!("invalid key length: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MemoryKeyStore, TAG_SIZE};

    struct BrokenStore;

    impl KeyStore for BrokenStore {
        fn get_key(&self) -> Result<Option<EncryptionKey>> {
            Err(BackupError::KeyUnavailable("credential store offline".into()))
        }

        fn put_key(&self, _key: &EncryptionKey) -> Result<()> {
            Err(BackupError::KeyUnavailable("credential store offline".into()))
        }

        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    fn provider() -> EncryptionProvider {
        EncryptionProvider::new(Arc::new(MemoryKeyStore::new()))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let provider = provider();
        let plaintext = b"archive bytes go here";

        let sealed = provider.encrypt(plaintext).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
        assert_ne!(&sealed[NONCE_SIZE..NONCE_SIZE + plaintext.len()], plaintext);

        assert_eq!(provider.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let provider = provider();
        let sealed = provider.encrypt(b"").unwrap();
        assert!(provider.decrypt(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_first_encrypt_generates_and_stores_key() {
        let store = Arc::new(MemoryKeyStore::new());
        let provider = EncryptionProvider::new(store.clone());

        assert!(store.get_key().unwrap().is_none());
        provider.encrypt(b"data").unwrap();
        let first = store.get_key().unwrap().unwrap();

        provider.encrypt(b"more data").unwrap();
        let second = store.get_key().unwrap().unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_nonces_are_unique() {
        let provider = provider();
        let a = provider.encrypt(b"same").unwrap();
        let b = provider.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = provider().encrypt(b"secret").unwrap();

        let other = EncryptionProvider::new(Arc::new(MemoryKeyStore::with_key(
            EncryptionKey::generate(),
        )));
        assert!(matches!(other.decrypt(&sealed), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let provider = provider();
        let mut sealed = provider.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(provider.decrypt(&sealed), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_short_input_is_invalid_ciphertext() {
        let provider = provider();
        provider.encrypt(b"x").unwrap();

        let result = provider.decrypt(&[0u8; NONCE_SIZE - 1]);
        assert!(matches!(
            result,
            Err(BackupError::InvalidCiphertext { len: 11, min: 12 })
        ));
    }

    #[test]
    fn test_decrypt_without_key_never_generates() {
        let store = Arc::new(MemoryKeyStore::new());
        let provider = EncryptionProvider::new(store.clone());

        let result = provider.decrypt(&[0u8; 64]);
        assert!(matches!(result, Err(BackupError::KeyUnavailable(_))));
        assert!(store.get_key().unwrap().is_none());
    }

    #[test]
    fn test_store_failure_is_key_unavailable() {
        let provider = EncryptionProvider::new(Arc::new(BrokenStore));
        assert!(matches!(
            provider.encrypt(b"data"),
            Err(BackupError::KeyUnavailable(_))
        ));
        assert!(matches!(
            provider.decrypt(&[0u8; 64]),
            Err(BackupError::KeyUnavailable(_))
        ));
    }
}
