// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Local key-file backend.
//!
//! Each master key lives in a key store directory as two files:
//!
//! - `<key_id>.key`: the raw 256-bit key, created once with mode 0600
//! - `<key_id>.json`: the [`MasterKey`] metadata, replaced atomically
//!
//! DEKs are wrapped with AES-256-GCM. The stored ciphertext is
//! `nonce || ciphertext || tag`, sealed with the key id as associated data
//! so a ciphertext only opens under the key that produced it. Suitable for
//! development, testing and single-host deployments.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::error::BackendError;
use super::traits::{
    KeyBackend, MasterKey, AES_256_KEY_SIZE, AES_GCM_NONCE_SIZE, AES_GCM_TAG_SIZE,
};
use crate::durable::write_atomic;

const KEY_FILE_EXT: &str = "key";
const META_FILE_EXT: &str = "json";

/// A master key (KEK) loaded into memory.
#[derive(Zeroize, ZeroizeOnDrop)]
#[allow(unused_assignments)]
struct LoadedKey {
    key: [u8; AES_256_KEY_SIZE],
    #[zeroize(skip)]
    meta: MasterKey,
}

/// Key-file backed [`KeyBackend`].
///
/// Loaded keys are cached in memory and zeroized on drop.
pub struct LocalKeyBackend {
    dir: PathBuf,
    keys: RwLock<HashMap<String, Arc<LoadedKey>>>,
    /// Serializes version allocation in `create_master_key`.
    create_lock: Mutex<()>,
    rng: SystemRandom,
}

impl LocalKeyBackend {
    /// Opens (creating if needed) a key store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keys: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            rng: SystemRandom::new(),
        })
    }

    /// Lists the metadata of every key in the store, oldest version first.
    pub fn list_keys(&self) -> Result<Vec<MasterKey>, BackendError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_FILE_EXT) {
                continue;
            }
            keys.push(read_metadata(&path)?);
        }
        keys.sort_by_key(|k| k.version);
        Ok(keys)
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{key_id}.{KEY_FILE_EXT}"))
    }

    fn meta_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{key_id}.{META_FILE_EXT}"))
    }

    fn load(&self, key_id: &str) -> Result<Arc<LoadedKey>, BackendError> {
        validate_key_id(key_id)?;

        if let Some(key) = self.keys.read().get(key_id) {
            return Ok(Arc::clone(key));
        }

        let meta_path = self.meta_path(key_id);
        let key_path = self.key_path(key_id);
        if !meta_path.exists() || !key_path.exists() {
            return Err(BackendError::KeyNotFound(key_id.to_string()));
        }

        let meta = read_metadata(&meta_path)?;
        let bytes = Zeroizing::new(fs::read(&key_path)?);
        if bytes.len() != AES_256_KEY_SIZE {
            return Err(BackendError::InvalidKeyLength {
                expected: AES_256_KEY_SIZE,
                got: bytes.len(),
            });
        }

        let mut key = [0u8; AES_256_KEY_SIZE];
        key.copy_from_slice(&bytes);
        let loaded = Arc::new(LoadedKey { key, meta });

        debug!(key_id = %key_id, "Loaded master key from key store");
        self.keys
            .write()
            .insert(key_id.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }

    fn load_enabled(&self, key_id: &str) -> Result<Arc<LoadedKey>, BackendError> {
        let key = self.load(key_id)?;
        if !key.meta.enabled {
            return Err(BackendError::KeyDisabled(key_id.to_string()));
        }
        Ok(key)
    }

    fn next_version(&self) -> Result<u32, BackendError> {
        Ok(self
            .list_keys()?
            .iter()
            .map(|k| k.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    fn write_key_file(&self, key_id: &str, key: &[u8]) -> Result<(), BackendError> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(self.key_path(key_id))?;
        file.write_all(key)?;
        file.sync_all()?;
        Ok(())
    }

    fn write_metadata(&self, meta: &MasterKey) -> Result<(), BackendError> {
        let path = self.meta_path(&meta.key_id);
        let json = serde_json::to_vec_pretty(meta).map_err(|e| BackendError::Metadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json)?;
        Ok(())
    }

    /// Encrypts data using AES-256-GCM.
    fn encrypt(&self, key: &LoadedKey, plaintext: &[u8]) -> Result<Vec<u8>, BackendError> {
        let mut nonce_bytes = [0u8; AES_GCM_NONCE_SIZE];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| BackendError::EncryptionFailed("failed to generate nonce".into()))?;

        let sealing_key = LessSafeKey::new(UnboundKey::new(&aead::AES_256_GCM, &key.key)?);

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(key.meta.key_id.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| BackendError::EncryptionFailed("AES-GCM seal failed".into()))?;

        let mut result = Vec::with_capacity(AES_GCM_NONCE_SIZE + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);
        Ok(result)
    }

    /// Decrypts data using AES-256-GCM.
    fn decrypt(
        &self,
        key: &LoadedKey,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        if ciphertext.len() < AES_GCM_NONCE_SIZE + AES_GCM_TAG_SIZE {
            return Err(BackendError::DecryptionFailed("ciphertext too short".into()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(AES_GCM_NONCE_SIZE);
        let mut nonce_arr = [0u8; AES_GCM_NONCE_SIZE];
        nonce_arr.copy_from_slice(nonce_bytes);

        let opening_key = LessSafeKey::new(UnboundKey::new(&aead::AES_256_GCM, &key.key)?);

        let mut in_out = Zeroizing::new(encrypted.to_vec());
        let plaintext_len = opening_key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_arr),
                Aad::from(key.meta.key_id.as_bytes()),
                in_out.as_mut_slice(),
            )
            .map_err(|_| BackendError::DecryptionFailed("AES-GCM open failed".into()))?
            .len();
        in_out.truncate(plaintext_len);

        Ok(in_out)
    }
}

#[async_trait]
impl KeyBackend for LocalKeyBackend {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_master_key(&self, description: &str) -> Result<MasterKey, BackendError> {
        let _guard = self.create_lock.lock();

        let mut key = [0u8; AES_256_KEY_SIZE];
        self.rng
            .fill(&mut key)
            .map_err(|_| BackendError::KeyGeneration("failed to generate random key".into()))?;

        let version = self.next_version()?;
        let key_id = format!("kek-{}", uuid::Uuid::new_v4());
        let mut meta = MasterKey::new(key_id.clone(), version);
        if !description.is_empty() {
            meta = meta.with_description(description);
        }

        let written = self
            .write_key_file(&key_id, &key)
            .and_then(|()| self.write_metadata(&meta));
        if let Err(e) = written {
            key.zeroize();
            let _ = fs::remove_file(self.key_path(&key_id));
            return Err(e);
        }

        self.keys
            .write()
            .insert(key_id.clone(), Arc::new(LoadedKey { key, meta: meta.clone() }));
        key.zeroize();

        info!(key_id = %key_id, version, "Created master key");
        Ok(meta)
    }

    async fn get_master_key(&self, key_id: &str) -> Result<MasterKey, BackendError> {
        Ok(self.load(key_id)?.meta.clone())
    }

    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        let key = self.load_enabled(key_id)?;
        self.decrypt(&key, ciphertext)
    }

    async fn encrypt_dek(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, BackendError> {
        let key = self.load_enabled(key_id)?;
        self.encrypt(&key, plaintext)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn disable_key(&self, key_id: &str) -> Result<(), BackendError> {
        let current = self.load(key_id)?;
        let mut meta = current.meta.clone();
        meta.enabled = false;
        self.write_metadata(&meta)?;

        let updated = Arc::new(LoadedKey {
            key: current.key,
            meta,
        });
        self.keys.write().insert(key_id.to_string(), updated);

        info!(key_id = %key_id, "Disabled master key");
        Ok(())
    }
}

/// Rejects identifiers that could escape the key store directory.
fn validate_key_id(key_id: &str) -> Result<(), BackendError> {
    let valid = !key_id.is_empty()
        && key_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(BackendError::KeyNotFound(key_id.to_string()))
    }
}

fn read_metadata(path: &Path) -> Result<MasterKey, BackendError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| BackendError::Metadata {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalKeyBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalKeyBackend::open(dir.path().join("keys")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_create_master_key() {
        let (_dir, backend) = backend();
        let key = backend.create_master_key("primary").await.unwrap();

        assert!(key.key_id.starts_with("kek-"));
        assert_eq!(key.version, 1);
        assert_eq!(key.description.as_deref(), Some("primary"));
        assert!(backend.key_path(&key.key_id).exists());
        assert!(backend.meta_path(&key.key_id).exists());
    }

    #[tokio::test]
    async fn test_versions_are_monotonic() {
        let (_dir, backend) = backend();
        let first = backend.create_master_key("").await.unwrap();
        let second = backend.create_master_key("").await.unwrap();

        assert_ne!(first.key_id, second.key_id);
        assert_eq!(second.version, first.version + 1);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_dek() {
        let (_dir, backend) = backend();
        let key = backend.create_master_key("").await.unwrap();
        let dek = [7u8; AES_256_KEY_SIZE];

        let ciphertext = backend.encrypt_dek(&dek, &key.key_id).await.unwrap();
        assert_ne!(&ciphertext[AES_GCM_NONCE_SIZE..], &dek[..]);

        let plaintext = backend.decrypt_dek(&ciphertext, &key.key_id).await.unwrap();
        assert_eq!(plaintext.as_slice(), &dek[..]);
    }

    #[tokio::test]
    async fn test_encrypt_produces_different_ciphertext() {
        let (_dir, backend) = backend();
        let key = backend.create_master_key("").await.unwrap();
        let dek = [1u8; AES_256_KEY_SIZE];

        let first = backend.encrypt_dek(&dek, &key.key_id).await.unwrap();
        let second = backend.encrypt_dek(&dek, &key.key_id).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_decrypt_under_other_key_fails() {
        let (_dir, backend) = backend();
        let old = backend.create_master_key("").await.unwrap();
        let new = backend.create_master_key("").await.unwrap();

        let ciphertext = backend.encrypt_dek(&[3u8; 32], &old.key_id).await.unwrap();
        let result = backend.decrypt_dek(&ciphertext, &new.key_id).await;
        assert!(matches!(result, Err(BackendError::DecryptionFailed(_))));
    }

    #[tokio::test]
    async fn test_decrypt_tampered_ciphertext_fails() {
        let (_dir, backend) = backend();
        let key = backend.create_master_key("").await.unwrap();

        let mut ciphertext = backend.encrypt_dek(&[9u8; 32], &key.key_id).await.unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;

        let result = backend.decrypt_dek(&ciphertext, &key.key_id).await;
        assert!(matches!(result, Err(BackendError::DecryptionFailed(_))));

        let result = backend.decrypt_dek(&[0u8; 4], &key.key_id).await;
        assert!(matches!(result, Err(BackendError::DecryptionFailed(_))));
    }

    #[tokio::test]
    async fn test_unknown_key_not_found() {
        let (_dir, backend) = backend();

        let result = backend.encrypt_dek(&[0u8; 32], "kek-missing").await;
        assert!(matches!(result, Err(BackendError::KeyNotFound(_))));

        let result = backend.get_master_key("../escape").await;
        assert!(matches!(result, Err(BackendError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_keys_survive_reopen() {
        let (dir, backend) = backend();
        let key = backend.create_master_key("").await.unwrap();
        let ciphertext = backend.encrypt_dek(&[5u8; 32], &key.key_id).await.unwrap();
        drop(backend);

        let reopened = LocalKeyBackend::open(dir.path().join("keys")).unwrap();
        let resolved = reopened.get_master_key(&key.key_id).await.unwrap();
        assert_eq!(resolved, key);

        let plaintext = reopened.decrypt_dek(&ciphertext, &key.key_id).await.unwrap();
        assert_eq!(plaintext.as_slice(), &[5u8; 32]);
        assert_eq!(reopened.list_keys().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_key_refuses_use() {
        let (dir, backend) = backend();
        let key = backend.create_master_key("").await.unwrap();
        backend.disable_key(&key.key_id).await.unwrap();

        let result = backend.encrypt_dek(&[0u8; 32], &key.key_id).await;
        assert!(matches!(result, Err(BackendError::KeyDisabled(_))));

        let reopened = LocalKeyBackend::open(dir.path().join("keys")).unwrap();
        assert!(!reopened.get_master_key(&key.key_id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_schedule_deletion_is_noop() {
        let (_dir, backend) = backend();
        let key = backend.create_master_key("").await.unwrap();

        backend
            .schedule_key_deletion(&key.key_id, std::time::Duration::from_secs(86_400))
            .await
            .unwrap();
        assert!(backend.key_path(&key.key_id).exists());
    }
}
