// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Key backends.
//!
//! A [`KeyBackend`] issues master keys (KEKs) and wraps/unwraps DEKs under
//! them. The rotation engine holds one `Arc<dyn KeyBackend>` and never
//! inspects the concrete type.
//!
//! ```text
//!            ┌──────────────────────┐
//!            │    RotationEngine    │
//!            └──────────┬───────────┘
//!                       │ Arc<dyn KeyBackend>
//!          ┌────────────┴────────────┐
//!  ┌───────┴────────┐       ┌────────┴───────┐
//!  │ LocalKeyBackend│       │ AwsKmsBackend  │
//!  │ key files +    │       │ (aws-kms       │
//!  │ AES-256-GCM    │       │  feature)      │
//!  └────────────────┘       └────────────────┘
//! ```

#[cfg(feature = "aws-kms")]
mod aws;
mod error;
mod local;
#[cfg(test)]
pub(crate) mod testing;
mod traits;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(feature = "aws-kms")]
pub use aws::AwsKmsBackend;
pub use error::BackendError;
pub use local::LocalKeyBackend;
pub use traits::{
    KeyBackend, MasterKey, AES_256_KEY_SIZE, AES_GCM_NONCE_SIZE, AES_GCM_TAG_SIZE,
    DEFAULT_ALGORITHM,
};

/// The available backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Key files in a local directory.
    Local,
    /// AWS KMS.
    AwsKms,
}

impl BackendKind {
    /// Returns the backend name as used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::AwsKms => "aws-kms",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendKind::Local),
            "aws-kms" | "aws" => Ok(BackendKind::AwsKms),
            other => Err(BackendError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Selects and configures a backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Which backend to use.
    pub kind: BackendKind,
    /// Key store directory for the local backend.
    pub key_store_dir: PathBuf,
}

impl BackendConfig {
    /// Local backend rooted at `key_store_dir`.
    pub fn local(key_store_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::Local,
            key_store_dir: key_store_dir.into(),
        }
    }

    /// Sets the backend kind.
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Builds the backend described by `config`.
pub async fn create_backend(config: &BackendConfig) -> Result<Arc<dyn KeyBackend>, BackendError> {
    match config.kind {
        BackendKind::Local => Ok(Arc::new(LocalKeyBackend::open(&config.key_store_dir)?)),
        #[cfg(feature = "aws-kms")]
        BackendKind::AwsKms => Ok(Arc::new(AwsKmsBackend::new().await)),
        #[cfg(not(feature = "aws-kms"))]
        BackendKind::AwsKms => Err(BackendError::UnsupportedBackend(
            "aws-kms requires building with the `aws-kms` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("aws-kms".parse::<BackendKind>().unwrap(), BackendKind::AwsKms);
        let err = "vault".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedBackend(ref name) if name == "vault"));
        assert!(!err.is_transient());
        assert_eq!(BackendKind::AwsKms.to_string(), "aws-kms");
    }

    #[tokio::test]
    async fn test_create_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = create_backend(&BackendConfig::local(dir.path())).await.unwrap();
        assert_eq!(backend.name(), "local");

        let key = backend.create_master_key("").await.unwrap();
        assert_eq!(backend.get_master_key(&key.key_id).await.unwrap(), key);
    }
}
