// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Run-level error taxonomy.

use std::path::PathBuf;

use crate::audit::AuditError;
use crate::backend::BackendError;
use crate::backup::BackupError;
use crate::progress::{ProgressError, RotationStatus};
use crate::records::RecordStoreError;

/// Errors surfaced by the rotation engine.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// Backend unreachable or timed out. Safe to retry the run later.
    #[error("key backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A referenced master key does not exist.
    #[error("master key not found: {0}")]
    KeyNotFound(String),

    /// A DEK could not be unwrapped under the old key.
    #[error("DEK decryption failed: {0}")]
    DecryptionFailed(String),

    /// A DEK could not be wrapped under the new key.
    #[error("DEK encryption failed: {0}")]
    EncryptionFailed(String),

    /// The post-rotation sample did not decrypt cleanly under the new key.
    #[error("verification failed for {failures} of {sampled} sampled records")]
    VerificationFailed { sampled: usize, failures: usize },

    /// A backup or checkpoint file is unreadable, malformed or tampered.
    #[error("invalid state file {path}: {reason}")]
    ChecksumOrFormat { path: PathBuf, reason: String },

    /// A previous run still owns the record set.
    #[error("rotation run {run_id} is still {status}; resume or roll back first")]
    RunInProgress {
        run_id: uuid::Uuid,
        status: RotationStatus,
    },

    /// No active, non-dry-run checkpoint exists.
    #[error("no interrupted rotation run to resume")]
    NoResumableRun,

    /// The checkpoint state machine forbids the change.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: RotationStatus,
        to: RotationStatus,
    },

    /// The request or configuration cannot be honored.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The run was interrupted through its cancellation token.
    #[error("rotation cancelled")]
    Cancelled,

    /// Any other backend failure.
    #[error("key backend error: {0}")]
    Backend(BackendError),

    /// Checkpoint bookkeeping failed.
    #[error("checkpoint error: {0}")]
    Progress(ProgressError),

    /// Loading or saving DEK records failed.
    #[error(transparent)]
    RecordStore(#[from] RecordStoreError),

    /// An audit event could not be written.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Filesystem failure outside the stores above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RotationError {
    /// Returns true if the same run may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, RotationError::BackendUnavailable(_))
    }
}

impl From<BackendError> for RotationError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::KeyNotFound(id) => RotationError::KeyNotFound(id),
            BackendError::DecryptionFailed(msg) => RotationError::DecryptionFailed(msg),
            BackendError::EncryptionFailed(msg) => RotationError::EncryptionFailed(msg),
            BackendError::Unavailable(msg) => RotationError::BackendUnavailable(msg),
            err @ BackendError::Timeout(_) => RotationError::BackendUnavailable(err.to_string()),
            other => RotationError::Backend(other),
        }
    }
}

impl From<ProgressError> for RotationError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Io(e) => RotationError::Io(e),
            ProgressError::Format { path, reason } => {
                RotationError::ChecksumOrFormat { path, reason }
            }
            ProgressError::InvalidTransition { from, to } => {
                RotationError::InvalidTransition { from, to }
            }
            other => RotationError::Progress(other),
        }
    }
}

impl From<BackupError> for RotationError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Io(e) => RotationError::Io(e),
            BackupError::Format { path, reason } => {
                RotationError::ChecksumOrFormat { path, reason }
            }
            BackupError::Checksum { path } => RotationError::ChecksumOrFormat {
                path,
                reason: "checksum mismatch".into(),
            },
            BackupError::DuplicateRecord(id) => {
                RotationError::InvalidRequest(format!("duplicate record id {id}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backend_errors_map_to_taxonomy() {
        assert!(matches!(
            RotationError::from(BackendError::KeyNotFound("k".into())),
            RotationError::KeyNotFound(id) if id == "k"
        ));
        assert!(RotationError::from(BackendError::Timeout(Duration::from_secs(1))).is_transient());
        assert!(RotationError::from(BackendError::Unavailable("down".into())).is_transient());
        assert!(!RotationError::from(BackendError::DecryptionFailed("tag".into())).is_transient());
        assert!(!RotationError::from(BackendError::UnsupportedBackend("vault".into())).is_transient());
        assert!(matches!(
            RotationError::from(BackendError::KeyDisabled("k".into())),
            RotationError::Backend(BackendError::KeyDisabled(_))
        ));
    }

    #[test]
    fn test_checksum_maps_to_format_error() {
        let err = RotationError::from(BackupError::Checksum {
            path: PathBuf::from("b.json"),
        });
        assert!(matches!(err, RotationError::ChecksumOrFormat { .. }));
    }
}
