// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! kekrotate: resumable, auditable master key rotation for envelope-encrypted DEKs
//!
//! This crate re-wraps every data encryption key (DEK) under a new key
//! encryption key (KEK) held by a pluggable key backend, with a durable
//! checkpoint, an append-only audit log, immutable backups and rollback.

pub mod audit;
pub mod backend;
pub mod backup;
mod durable;
pub mod engine;
pub mod error;
pub mod progress;
pub mod records;

pub use audit::{AuditAction, AuditError, AuditEvent, AuditLog, AuditStatus};
pub use backend::{
    create_backend, BackendConfig, BackendError, BackendKind, KeyBackend, LocalKeyBackend,
    MasterKey,
};
pub use backup::{BackupDocument, BackupError, BackupManager, BackupMetadata};
pub use engine::{
    KeyRetirement, RotationConfig, RotationEngine, RotationPaths, RotationRequest,
    RotationResult, VerificationOutcome, VerificationSampling,
};
pub use error::RotationError;
pub use progress::{ProgressError, ProgressStore, ProgressUpdate, RotationProgress, RotationStatus};
pub use records::{DekRecord, JsonFileRecordStore, MemoryRecordStore, RecordStore, RecordStoreError};
