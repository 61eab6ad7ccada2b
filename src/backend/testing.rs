// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Fault-injecting backend wrapper for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{BackendError, KeyBackend, MasterKey};

/// Wraps a real backend and injects failures keyed by ciphertext.
pub(crate) struct FaultyBackend {
    inner: Arc<dyn KeyBackend>,
    fail_decrypt: Mutex<HashSet<Vec<u8>>>,
    hang_decrypt: Mutex<HashSet<Vec<u8>>>,
    corrupt_encrypt: bool,
    cancel_after_encrypts: Option<(usize, CancellationToken)>,
    pub(crate) decrypt_calls: AtomicUsize,
    pub(crate) encrypt_calls: AtomicUsize,
    pub(crate) create_calls: AtomicUsize,
}

impl FaultyBackend {
    pub(crate) fn new(inner: Arc<dyn KeyBackend>) -> Self {
        Self {
            inner,
            fail_decrypt: Mutex::new(HashSet::new()),
            hang_decrypt: Mutex::new(HashSet::new()),
            corrupt_encrypt: false,
            cancel_after_encrypts: None,
            decrypt_calls: AtomicUsize::new(0),
            encrypt_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Decrypting this ciphertext fails with `DecryptionFailed`.
    pub(crate) fn fail_decrypt_of(self, ciphertext: &[u8]) -> Self {
        self.fail_decrypt.lock().insert(ciphertext.to_vec());
        self
    }

    /// Decrypting this ciphertext never completes.
    pub(crate) fn hang_decrypt_of(self, ciphertext: &[u8]) -> Self {
        self.hang_decrypt.lock().insert(ciphertext.to_vec());
        self
    }

    /// Every ciphertext produced by `encrypt_dek` is tampered with.
    pub(crate) fn corrupt_encrypt(mut self) -> Self {
        self.corrupt_encrypt = true;
        self
    }

    /// Cancels `token` once `count` encryptions have completed.
    pub(crate) fn cancel_after_encrypts(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after_encrypts = Some((count, token));
        self
    }

    pub(crate) fn backend_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
            + self.encrypt_calls.load(Ordering::SeqCst)
            + self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyBackend for FaultyBackend {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn create_master_key(&self, description: &str) -> Result<MasterKey, BackendError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_master_key(description).await
    }

    async fn get_master_key(&self, key_id: &str) -> Result<MasterKey, BackendError> {
        self.inner.get_master_key(key_id).await
    }

    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_decrypt.lock().contains(ciphertext) {
            return Err(BackendError::DecryptionFailed("injected failure".into()));
        }
        let hang = self.hang_decrypt.lock().contains(ciphertext);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.decrypt_dek(ciphertext, key_id).await
    }

    async fn encrypt_dek(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, BackendError> {
        let mut ciphertext = self.inner.encrypt_dek(plaintext, key_id).await?;
        if self.corrupt_encrypt {
            let last = ciphertext.len() - 1;
            ciphertext[last] ^= 0xFF;
        }

        let done = self.encrypt_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((count, token)) = &self.cancel_after_encrypts {
            if done >= *count {
                token.cancel();
            }
        }
        Ok(ciphertext)
    }

    async fn disable_key(&self, key_id: &str) -> Result<(), BackendError> {
        self.inner.disable_key(key_id).await
    }

    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        grace_period: Duration,
    ) -> Result<(), BackendError> {
        self.inner.schedule_key_deletion(key_id, grace_period).await
    }
}
