// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Append-only audit log for rotation runs.
//!
//! Every state transition, per-record outcome, backup and rollback is
//! written as one JSON object per line. Each event is written and synced
//! before [`AuditLog::log`] returns, so the file is a complete forensic
//! record even if the progress checkpoint or the record store is lost.
//!
//! Events are also mirrored to `tracing` under the `audit` target.
//!
//! # Example
//!
//! ```rust,no_run
//! use kekrotate::audit::{AuditAction, AuditEvent, AuditLog, AuditStatus};
//!
//! let log = AuditLog::open("state/rotation_audit.jsonl").unwrap();
//! log.log(AuditEvent::new(AuditAction::RotationStarted, AuditStatus::Started))
//!     .unwrap();
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

/// Actions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A rotate request was accepted.
    RotationStarted,
    /// An interrupted run was picked up again.
    RotationResumed,
    /// An existing master key was looked up.
    KeyResolved,
    /// A new master key was minted.
    KeyCreated,
    /// The pre-run record snapshot was written.
    BackupCreated,
    /// The run checkpoint was written.
    ProgressInitialized,
    /// One DEK was re-wrapped.
    DekRotated,
    /// One DEK could not be re-wrapped.
    DekRotationFailed,
    /// The record store was saved.
    RecordsPersisted,
    /// Sampling under the new key began.
    VerificationStarted,
    /// Sampling finished.
    VerificationCompleted,
    /// The run finished with every record rotated and verified.
    RotationCompleted,
    /// The run aborted or finished with failures.
    RotationFailed,
    /// The run stopped on cancellation.
    RotationCancelled,
    /// A backup passed validation and restore began.
    RollbackStarted,
    /// Records were restored from a backup.
    RollbackCompleted,
    /// A rollback was refused or did not finish.
    RollbackFailed,
    /// The old master key was disabled.
    KeyDisabled,
    /// The old master key was scheduled for deletion.
    KeyDeletionScheduled,
}

impl AuditAction {
    /// Returns the action name as written to the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RotationStarted => "rotation_started",
            AuditAction::RotationResumed => "rotation_resumed",
            AuditAction::KeyResolved => "key_resolved",
            AuditAction::KeyCreated => "key_created",
            AuditAction::BackupCreated => "backup_created",
            AuditAction::ProgressInitialized => "progress_initialized",
            AuditAction::DekRotated => "dek_rotated",
            AuditAction::DekRotationFailed => "dek_rotation_failed",
            AuditAction::RecordsPersisted => "records_persisted",
            AuditAction::VerificationStarted => "verification_started",
            AuditAction::VerificationCompleted => "verification_completed",
            AuditAction::RotationCompleted => "rotation_completed",
            AuditAction::RotationFailed => "rotation_failed",
            AuditAction::RotationCancelled => "rotation_cancelled",
            AuditAction::RollbackStarted => "rollback_started",
            AuditAction::RollbackCompleted => "rollback_completed",
            AuditAction::RollbackFailed => "rollback_failed",
            AuditAction::KeyDisabled => "key_disabled",
            AuditAction::KeyDeletionScheduled => "key_deletion_scheduled",
        }
    }
}

/// Outcome attached to an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Started,
    Success,
    Failure,
    Warning,
}

impl AuditStatus {
    /// Returns the severity level for this status.
    pub fn severity(&self) -> AuditSeverity {
        match self {
            AuditStatus::Started | AuditStatus::Success => AuditSeverity::Info,
            AuditStatus::Warning => AuditSeverity::Warning,
            AuditStatus::Failure => AuditSeverity::Error,
        }
    }
}

/// Severity levels for audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
}

/// A single audit log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub action: AuditAction,
    pub status: AuditStatus,
    #[serde(default)]
    pub details: Value,
}

impl AuditEvent {
    /// Creates a new event stamped with the current time.
    pub fn new(action: AuditAction, status: AuditStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: None,
            action,
            status,
            details: Value::Object(Default::default()),
        }
    }

    /// Attaches the run the event belongs to.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Adds one detail field.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Adds an error detail.
    pub fn with_error(self, error: impl std::fmt::Display) -> Self {
        self.with_detail("error", error.to_string())
    }
}

/// Errors writing or replaying the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed audit log line {line}: {reason}")]
    Format { line: usize, reason: String },
}

/// Append-only NDJSON audit log.
///
/// Writes are serialized through a mutex; each event is one `write_all`
/// followed by a flush and `sync_data`.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

impl AuditLog {
    /// Opens or creates the log for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an event and syncs it to disk.
    pub fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&event).map_err(|e| AuditError::Format {
            line: 0,
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        {
            let mut file = self.file.lock();
            file.write_all(&line)?;
            file.flush()?;
            file.sync_data()?;
        }

        mirror_to_tracing(&event);
        Ok(())
    }

    /// Reads back every event in the log at `path`.
    pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, AuditError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| AuditError::Format {
                line: idx + 1,
                reason: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

fn mirror_to_tracing(event: &AuditEvent) {
    let run_id = event.run_id.map(|id| id.to_string()).unwrap_or_default();
    match event.status.severity() {
        AuditSeverity::Info => {
            info!(
                target: "audit",
                run_id = %run_id,
                action = event.action.as_str(),
                details = %event.details,
                "Rotation audit event"
            );
        }
        AuditSeverity::Warning => {
            warn!(
                target: "audit",
                run_id = %run_id,
                action = event.action.as_str(),
                details = %event.details,
                "Rotation audit warning"
            );
        }
        AuditSeverity::Error => {
            tracing::error!(
                target: "audit",
                run_id = %run_id,
                action = event.action.as_str(),
                details = %event.details,
                "Rotation audit failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_with_details() {
        let run = Uuid::new_v4();
        let event = AuditEvent::new(AuditAction::DekRotated, AuditStatus::Success)
            .with_run(run)
            .with_detail("record_id", "orders/1")
            .with_detail("key_version", 2);

        assert_eq!(event.run_id, Some(run));
        assert_eq!(event.details["record_id"], "orders/1");
        assert_eq!(event.details["key_version"], 2);
    }

    #[test]
    fn test_status_severity() {
        assert_eq!(AuditStatus::Success.severity(), AuditSeverity::Info);
        assert_eq!(AuditStatus::Warning.severity(), AuditSeverity::Warning);
        assert_eq!(AuditStatus::Failure.severity(), AuditSeverity::Error);
    }

    #[test]
    fn test_log_is_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl")).unwrap();

        log.log(AuditEvent::new(AuditAction::RotationStarted, AuditStatus::Started))
            .unwrap();
        log.log(
            AuditEvent::new(AuditAction::DekRotationFailed, AuditStatus::Failure)
                .with_error("decryption failed"),
        )
        .unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["action"], "dek_rotation_failed");
        assert_eq!(second["status"], "failure");
        assert_eq!(second["details"]["error"], "decryption failed");
    }

    #[test]
    fn test_log_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = AuditLog::open(&path).unwrap();
        log.log(AuditEvent::new(AuditAction::RotationStarted, AuditStatus::Started))
            .unwrap();
        drop(log);

        let log = AuditLog::open(&path).unwrap();
        log.log(AuditEvent::new(AuditAction::RotationCompleted, AuditStatus::Success))
            .unwrap();

        let events = AuditLog::read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, AuditAction::RotationStarted);
        assert_eq!(events[1].action, AuditAction::RotationCompleted);
    }

    #[test]
    fn test_action_names_match_serialization() {
        let event = AuditEvent::new(AuditAction::KeyDeletionScheduled, AuditStatus::Success);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], AuditAction::KeyDeletionScheduled.as_str());
    }
}
