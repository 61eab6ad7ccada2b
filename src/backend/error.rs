// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Key backend error types.

use std::path::PathBuf;

/// Errors that can occur inside a key backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Master key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The referenced master key does not exist in the backend.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The referenced master key exists but has been disabled.
    #[error("key disabled: {0}")]
    KeyDisabled(String),

    /// Decryption failed (tag mismatch, malformed or foreign ciphertext).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// The backend could not be reached or refused service.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A backend call did not finish within the caller-supplied timeout.
    #[error("backend call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Key store metadata could not be read or parsed.
    #[error("corrupt key metadata at {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    /// The backend name is unknown or not compiled into this build.
    #[error("unsupported key backend: {0}")]
    UnsupportedBackend(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ring crypto error.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl BackendError {
    /// Returns true if retrying the whole run later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

impl From<ring::error::Unspecified> for BackendError {
    fn from(_: ring::error::Unspecified) -> Self {
        BackendError::Crypto("unspecified cryptographic error".to_string())
    }
}
