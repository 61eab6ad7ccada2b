// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! AWS KMS backend.
//!
//! Master keys are symmetric KMS keys. DEKs are wrapped and unwrapped
//! server-side with `Encrypt`/`Decrypt`; the KEK never leaves AWS KMS.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{KeyMetadata, KeySpec, KeyUsageType, OriginType};
use aws_sdk_kms::Client as KmsClient;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use super::error::BackendError;
use super::traits::{KeyBackend, MasterKey};

/// Shortest pending window AWS accepts for `ScheduleKeyDeletion`.
const MIN_DELETION_WINDOW_DAYS: i32 = 7;
/// Longest pending window AWS accepts for `ScheduleKeyDeletion`.
const MAX_DELETION_WINDOW_DAYS: i32 = 30;

/// AWS KMS-backed [`KeyBackend`].
pub struct AwsKmsBackend {
    client: KmsClient,
}

impl AwsKmsBackend {
    /// Creates a backend from the default AWS credential and region chain.
    pub async fn new() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::from_config(&config)
    }

    /// Creates from an existing AWS SDK config.
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: KmsClient::new(config),
        }
    }
}

#[async_trait]
impl KeyBackend for AwsKmsBackend {
    fn name(&self) -> &str {
        "aws-kms"
    }

    #[instrument(skip(self), fields(backend = "aws-kms"))]
    async fn create_master_key(&self, description: &str) -> Result<MasterKey, BackendError> {
        let output = self
            .client
            .create_key()
            .description(description)
            .key_usage(KeyUsageType::EncryptDecrypt)
            .key_spec(KeySpec::SymmetricDefault)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "", BackendError::KeyGeneration))?;

        let metadata = output
            .key_metadata()
            .ok_or_else(|| BackendError::KeyGeneration("no key metadata from KMS".into()))?;
        let key = master_key_from_metadata(metadata);

        info!(key_id = %key.key_id, "Created AWS KMS master key");
        Ok(key)
    }

    #[instrument(skip(self), fields(backend = "aws-kms"))]
    async fn get_master_key(&self, key_id: &str) -> Result<MasterKey, BackendError> {
        let output = self
            .client
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key_id, BackendError::Unavailable))?;

        output
            .key_metadata()
            .map(master_key_from_metadata)
            .ok_or_else(|| BackendError::KeyNotFound(key_id.to_string()))
    }

    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        let output = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| {
                warn!(key_id = %key_id, "AWS KMS decrypt failed");
                map_sdk_error(e, key_id, BackendError::DecryptionFailed)
            })?;

        output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| BackendError::DecryptionFailed("no plaintext from KMS".into()))
    }

    async fn encrypt_dek(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, BackendError> {
        let output = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|e| {
                warn!(key_id = %key_id, "AWS KMS encrypt failed");
                map_sdk_error(e, key_id, BackendError::EncryptionFailed)
            })?;

        output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| BackendError::EncryptionFailed("no ciphertext from KMS".into()))
    }

    #[instrument(skip(self), fields(backend = "aws-kms"))]
    async fn disable_key(&self, key_id: &str) -> Result<(), BackendError> {
        self.client
            .disable_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key_id, BackendError::Unavailable))?;

        info!(key_id = %key_id, "Disabled AWS KMS key");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "aws-kms"))]
    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        grace_period: Duration,
    ) -> Result<(), BackendError> {
        let days = deletion_window_days(grace_period);
        self.client
            .schedule_key_deletion()
            .key_id(key_id)
            .pending_window_in_days(days)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key_id, BackendError::Unavailable))?;

        info!(key_id = %key_id, pending_window_days = days, "Scheduled AWS KMS key deletion");
        Ok(())
    }
}

fn master_key_from_metadata(metadata: &KeyMetadata) -> MasterKey {
    let created_at = metadata
        .creation_date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.secs(), d.subsec_nanos()))
        .unwrap_or_else(Utc::now);
    let version = u32::try_from(created_at.timestamp()).unwrap_or(0);

    let mut key = MasterKey::new(metadata.key_id(), version);
    key.created_at = created_at;
    key.enabled = metadata.enabled();
    if let Some(arn) = metadata.arn() {
        key = key.with_resource_name(arn);
    }
    if let Some(description) = metadata.description().filter(|d| !d.is_empty()) {
        key = key.with_description(description);
    }
    if let Some(spec) = metadata.key_spec() {
        if *spec != KeySpec::SymmetricDefault {
            key.algorithm = spec.as_str().to_string();
        }
    }
    if matches!(metadata.origin(), Some(OriginType::AwsCloudhsm)) {
        key = key.hardware_backed();
    }
    key
}

/// Rounds a grace period up to whole days within the window AWS accepts.
fn deletion_window_days(grace_period: Duration) -> i32 {
    let days = grace_period.as_secs().div_ceil(86_400);
    i32::try_from(days)
        .unwrap_or(MAX_DELETION_WINDOW_DAYS)
        .clamp(MIN_DELETION_WINDOW_DAYS, MAX_DELETION_WINDOW_DAYS)
}

/// Maps an SDK error onto the backend taxonomy.
///
/// `fallback` builds the operation-specific error for anything that is not
/// a missing key, a disabled key, a bad ciphertext or a transport failure.
fn map_sdk_error<E, R>(
    err: SdkError<E, R>,
    key_id: &str,
    fallback: fn(String) -> BackendError,
) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            BackendError::Unavailable(message)
        }
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some("NotFoundException") => BackendError::KeyNotFound(key_id.to_string()),
            Some("DisabledException") | Some("KMSInvalidStateException") => {
                BackendError::KeyDisabled(key_id.to_string())
            }
            Some("InvalidCiphertextException") | Some("IncorrectKeyException") => {
                BackendError::DecryptionFailed(message)
            }
            Some("KMSInternalException")
            | Some("DependencyTimeoutException")
            | Some("KeyUnavailableException")
            | Some("ThrottlingException") => BackendError::Unavailable(message),
            _ => fallback(message),
        },
        _ => fallback(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_window_is_clamped() {
        assert_eq!(deletion_window_days(Duration::from_secs(0)), 7);
        assert_eq!(deletion_window_days(Duration::from_secs(10 * 86_400)), 10);
        assert_eq!(deletion_window_days(Duration::from_secs(10 * 86_400 + 1)), 11);
        assert_eq!(deletion_window_days(Duration::from_secs(365 * 86_400)), 30);
    }

    // Integration tests require AWS credentials.
    // Run with: cargo test --features aws-kms -- --ignored

    #[tokio::test]
    #[ignore = "requires AWS credentials"]
    async fn test_aws_kms_round_trip() {
        let backend = AwsKmsBackend::new().await;
        let key = backend.create_master_key("kekrotate test").await.unwrap();

        let ciphertext = backend.encrypt_dek(&[4u8; 32], &key.key_id).await.unwrap();
        let plaintext = backend.decrypt_dek(&ciphertext, &key.key_id).await.unwrap();
        assert_eq!(plaintext.as_slice(), &[4u8; 32]);

        backend
            .schedule_key_deletion(&key.key_id, Duration::from_secs(7 * 86_400))
            .await
            .unwrap();
    }
}
