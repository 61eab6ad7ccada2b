// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Key backend trait and master key metadata.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use super::error::BackendError;

/// Size of AES-256 keys in bytes.
pub const AES_256_KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes.
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Size of AES-GCM authentication tag in bytes.
pub const AES_GCM_TAG_SIZE: usize = 16;

/// Algorithm identifier recorded on master keys unless a backend says otherwise.
pub const DEFAULT_ALGORITHM: &str = "AES-256-GCM";

/// Metadata describing a key encryption key (KEK).
///
/// Never carries key material. Immutable once issued, apart from the
/// `enabled` flag which tracks lifecycle changes made after a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKey {
    /// Opaque identifier used in every backend call.
    pub key_id: String,
    /// Provider-assigned resource name (ARN, resource path), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    /// Monotonic version number within the issuing backend.
    pub version: u32,
    /// When the key was issued.
    pub created_at: DateTime<Utc>,
    /// Algorithm identifier.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Whether the key material lives in an HSM.
    #[serde(default)]
    pub hardware_backed: bool,
    /// Free-form description supplied at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// False once the key has been disabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_algorithm() -> String {
    DEFAULT_ALGORITHM.to_string()
}

fn default_enabled() -> bool {
    true
}

impl MasterKey {
    /// Creates metadata for a freshly issued software key.
    pub fn new(key_id: impl Into<String>, version: u32) -> Self {
        Self {
            key_id: key_id.into(),
            resource_name: None,
            version,
            created_at: Utc::now(),
            algorithm: default_algorithm(),
            hardware_backed: false,
            description: None,
            enabled: true,
        }
    }

    /// Sets the provider resource name.
    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Marks the key as hardware backed.
    pub fn hardware_backed(mut self) -> Self {
        self.hardware_backed = true;
        self
    }
}

/// Key management backend interface.
///
/// Issues master keys and wraps/unwraps individual DEKs under a named
/// master key. Implementations may keep keys in local files, a cloud KMS
/// or an HSM; the rotation engine only ever holds an `Arc<dyn KeyBackend>`.
///
/// All operations are async to support backends that require network calls.
/// Plaintext DEKs cross this boundary only inside [`Zeroizing`] buffers and
/// must never be logged or persisted by an implementation.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Short backend name for logs and audit details.
    fn name(&self) -> &str;

    /// Issues a new master key.
    ///
    /// Every call mints a distinct key; callers that retry must check for
    /// a key created by the earlier attempt before calling again.
    async fn create_master_key(&self, description: &str) -> Result<MasterKey, BackendError>;

    /// Resolves an existing master key by identifier.
    async fn get_master_key(&self, key_id: &str) -> Result<MasterKey, BackendError>;

    /// Decrypts a DEK ciphertext produced by [`KeyBackend::encrypt_dek`] under `key_id`.
    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, BackendError>;

    /// Encrypts a plaintext DEK under `key_id`.
    async fn encrypt_dek(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, BackendError>;

    /// Disables a master key so it can no longer be used.
    async fn disable_key(&self, key_id: &str) -> Result<(), BackendError>;

    /// Schedules a master key for deletion after `grace_period`.
    ///
    /// Backends without scheduled deletion keep this default, which warns
    /// and succeeds.
    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        grace_period: Duration,
    ) -> Result<(), BackendError> {
        warn!(
            backend = self.name(),
            key_id = %key_id,
            grace_period_secs = grace_period.as_secs(),
            "Backend does not support scheduled key deletion, skipping"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_defaults() {
        let key = MasterKey::new("kek-1", 1);
        assert_eq!(key.algorithm, DEFAULT_ALGORITHM);
        assert!(key.enabled);
        assert!(!key.hardware_backed);
        assert!(key.resource_name.is_none());
    }

    #[test]
    fn test_master_key_metadata_without_optional_fields() {
        let json = r#"{"key_id":"kek-legacy","version":3,"created_at":"2025-01-01T00:00:00Z"}"#;
        let key: MasterKey = serde_json::from_str(json).unwrap();
        assert_eq!(key.version, 3);
        assert_eq!(key.algorithm, DEFAULT_ALGORITHM);
        assert!(key.enabled);
    }
}
