// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Durable rotation checkpoint.
//!
//! The checkpoint is a single JSON document rewritten in full on every
//! mutation (temp file, fsync, rename). A crash mid-write leaves the last
//! complete checkpoint in place, so counters are never worse than the last
//! successful update. Updates go through one mutex: there is a single
//! writer even when backend calls run concurrently.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::backend::MasterKey;
use crate::durable::write_atomic;

/// Rotation run state machine.
///
/// ```text
/// NotStarted → InProgress → Verifying → Completed
///                  │            └──────→ Failed
///                  └──→ RolledBack ←── Completed | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    /// Checkpoint written, no record attempted yet.
    NotStarted,
    /// Records are being re-wrapped.
    InProgress,
    /// All records attempted; sampling under the new key.
    Verifying,
    /// Verification passed.
    Completed,
    /// Verification failed or records could not be rotated.
    Failed,
    /// Records restored from the run's backup.
    RolledBack,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStatus::NotStarted => "not_started",
            RotationStatus::InProgress => "in_progress",
            RotationStatus::Verifying => "verifying",
            RotationStatus::Completed => "completed",
            RotationStatus::Failed => "failed",
            RotationStatus::RolledBack => "rolled_back",
        }
    }

    /// Returns true if the state machine permits `self → next`.
    pub fn can_transition_to(self, next: RotationStatus) -> bool {
        use RotationStatus::*;
        matches!(
            (self, next),
            (NotStarted, InProgress)
                | (InProgress, Verifying)
                | (Verifying, Completed)
                | (Verifying, Failed)
                | (InProgress, RolledBack)
                | (Completed, RolledBack)
                | (Failed, RolledBack)
        )
    }

    /// Returns true while a run still owns the live record set.
    pub fn is_active(self) -> bool {
        matches!(self, RotationStatus::InProgress | RotationStatus::Verifying)
    }
}

impl std::fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resumable checkpoint of one rotation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationProgress {
    pub run_id: Uuid,
    pub total_deks: usize,
    pub processed_deks: usize,
    pub failed_deks: usize,
    pub failed_records: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RotationStatus,
    pub old_key: MasterKey,
    pub new_key: MasterKey,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub backup_location: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl RotationProgress {
    /// Creates a fresh checkpoint in `NotStarted`.
    pub fn new(run_id: Uuid, total_deks: usize, old_key: MasterKey, new_key: MasterKey) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            total_deks,
            processed_deks: 0,
            failed_deks: 0,
            failed_records: Vec::new(),
            start_time: now,
            end_time: None,
            status: RotationStatus::NotStarted,
            old_key,
            new_key,
            dry_run: false,
            backup_location: None,
            updated_at: now,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_backup_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.backup_location = Some(location.into());
        self
    }

    /// Percentage of records processed, 100 for an empty run.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_deks == 0 {
            return 100.0;
        }
        self.processed_deks as f64 / self.total_deks as f64 * 100.0
    }

    /// Records neither processed nor failed yet.
    pub fn remaining(&self) -> usize {
        self.total_deks
            .saturating_sub(self.processed_deks + self.failed_deks)
    }
}

/// A per-record counter change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    Processed,
    Failed { record_id: String },
}

/// Errors raised by the progress store.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// Reading or writing the checkpoint file failed.
    #[error("progress I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The checkpoint file does not parse.
    #[error("malformed progress checkpoint {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// The state machine forbids the requested status change.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: RotationStatus,
        to: RotationStatus,
    },

    /// An update would count more records than the run holds.
    #[error("progress update exceeds total of {total} records")]
    CounterOverflow { total: usize },

    /// No checkpoint has been initialized or loaded.
    #[error("no rotation progress has been initialized")]
    NotInitialized,
}

/// File-backed checkpoint store.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    state: Mutex<Option<RotationProgress>>,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a fresh checkpoint and moves it to `InProgress`.
    pub fn initialize(&self, progress: RotationProgress) -> Result<RotationProgress, ProgressError> {
        if !progress.status.can_transition_to(RotationStatus::InProgress) {
            return Err(ProgressError::InvalidTransition {
                from: progress.status,
                to: RotationStatus::InProgress,
            });
        }

        let mut state = self.state.lock();
        let mut next = progress;
        next.status = RotationStatus::InProgress;
        self.persist(&mut next)?;
        *state = Some(next.clone());
        Ok(next)
    }

    /// Replaces the checkpoint wholesale, used when a run is resumed.
    pub fn checkpoint(&self, progress: RotationProgress) -> Result<RotationProgress, ProgressError> {
        let mut state = self.state.lock();
        let mut next = progress;
        self.persist(&mut next)?;
        *state = Some(next.clone());
        Ok(next)
    }

    /// Applies one per-record update and persists the result.
    pub fn update(&self, update: ProgressUpdate) -> Result<RotationProgress, ProgressError> {
        self.mutate(|progress| {
            if progress.processed_deks + progress.failed_deks >= progress.total_deks {
                return Err(ProgressError::CounterOverflow {
                    total: progress.total_deks,
                });
            }
            match update {
                ProgressUpdate::Processed => progress.processed_deks += 1,
                ProgressUpdate::Failed { record_id } => {
                    progress.failed_deks += 1;
                    progress.failed_records.push(record_id);
                }
            }
            Ok(())
        })
    }

    /// Moves the run to `status` if the state machine allows it.
    pub fn set_status(&self, status: RotationStatus) -> Result<RotationProgress, ProgressError> {
        self.mutate(|progress| {
            if !progress.status.can_transition_to(status) {
                return Err(ProgressError::InvalidTransition {
                    from: progress.status,
                    to: status,
                });
            }
            progress.status = status;
            if !status.is_active() {
                progress.end_time = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Ends the run in `Completed` or `Failed` and records the end time.
    pub fn complete(&self, status: RotationStatus) -> Result<RotationProgress, ProgressError> {
        if !matches!(status, RotationStatus::Completed | RotationStatus::Failed) {
            let from = self
                .current()
                .map(|p| p.status)
                .unwrap_or(RotationStatus::NotStarted);
            return Err(ProgressError::InvalidTransition { from, to: status });
        }
        self.set_status(status)
    }

    /// Loads the checkpoint from disk, if one exists.
    pub fn load(&self) -> Result<Option<RotationProgress>, ProgressError> {
        let mut state = self.state.lock();
        if !self.path.exists() {
            *state = None;
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)?;
        let progress: RotationProgress =
            serde_json::from_slice(&bytes).map_err(|e| ProgressError::Format {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if progress.processed_deks + progress.failed_deks > progress.total_deks {
            return Err(ProgressError::Format {
                path: self.path.clone(),
                reason: "counters exceed total".into(),
            });
        }

        *state = Some(progress.clone());
        Ok(Some(progress))
    }

    /// Returns the in-memory checkpoint without touching disk.
    pub fn current(&self) -> Option<RotationProgress> {
        self.state.lock().clone()
    }

    fn mutate<F>(&self, apply: F) -> Result<RotationProgress, ProgressError>
    where
        F: FnOnce(&mut RotationProgress) -> Result<(), ProgressError>,
    {
        let mut state = self.state.lock();
        let mut next = state.clone().ok_or(ProgressError::NotInitialized)?;
        apply(&mut next)?;
        self.persist(&mut next)?;
        *state = Some(next.clone());
        Ok(next)
    }

    fn persist(&self, progress: &mut RotationProgress) -> Result<(), ProgressError> {
        progress.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(progress).map_err(|e| ProgressError::Format {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &json)?;

        debug!(
            run_id = %progress.run_id,
            status = progress.status.as_str(),
            processed = progress.processed_deks,
            failed = progress.failed_deks,
            total = progress.total_deks,
            "Checkpoint written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: usize) -> RotationProgress {
        RotationProgress::new(
            Uuid::new_v4(),
            total,
            MasterKey::new("kek-old", 1),
            MasterKey::new("kek-new", 2),
        )
    }

    fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("rotation_progress.json"));
        (dir, store)
    }

    #[test]
    fn test_transitions() {
        use RotationStatus::*;
        assert!(NotStarted.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Completed));
        assert!(Verifying.can_transition_to(Failed));
        assert!(Completed.can_transition_to(RolledBack));
        assert!(InProgress.can_transition_to(RolledBack));

        assert!(!NotStarted.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!RolledBack.can_transition_to(InProgress));
    }

    #[test]
    fn test_initialize_and_update() {
        let (_dir, store) = store();
        let p = store.initialize(progress(3)).unwrap();
        assert_eq!(p.status, RotationStatus::InProgress);

        store.update(ProgressUpdate::Processed).unwrap();
        let p = store
            .update(ProgressUpdate::Failed {
                record_id: "b".into(),
            })
            .unwrap();

        assert_eq!(p.processed_deks, 1);
        assert_eq!(p.failed_deks, 1);
        assert_eq!(p.failed_records, vec!["b".to_string()]);
        assert_eq!(p.remaining(), 1);
    }

    #[test]
    fn test_every_update_is_durable() {
        let (dir, store) = store();
        let initial = store.initialize(progress(4)).unwrap();
        store.update(ProgressUpdate::Processed).unwrap();
        store.update(ProgressUpdate::Processed).unwrap();

        // A fresh store over the same file sees the last update.
        let reloaded = ProgressStore::new(dir.path().join("rotation_progress.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.run_id, initial.run_id);
        assert_eq!(reloaded.processed_deks, 2);
        assert_eq!(reloaded.progress_percentage(), 50.0);
    }

    #[test]
    fn test_counter_overflow_rejected() {
        let (_dir, store) = store();
        store.initialize(progress(1)).unwrap();
        store.update(ProgressUpdate::Processed).unwrap();

        assert!(matches!(
            store.update(ProgressUpdate::Processed),
            Err(ProgressError::CounterOverflow { total: 1 })
        ));
        assert_eq!(store.current().unwrap().processed_deks, 1);
    }

    #[test]
    fn test_complete_sets_end_time() {
        let (_dir, store) = store();
        store.initialize(progress(0)).unwrap();

        assert!(matches!(
            store.complete(RotationStatus::Completed),
            Err(ProgressError::InvalidTransition { .. })
        ));

        store.set_status(RotationStatus::Verifying).unwrap();
        let p = store.complete(RotationStatus::Completed).unwrap();
        assert_eq!(p.status, RotationStatus::Completed);
        assert!(p.end_time.is_some());
        assert_eq!(p.progress_percentage(), 100.0);
    }

    #[test]
    fn test_update_before_initialize_fails() {
        let (_dir, store) = store();
        assert!(matches!(
            store.update(ProgressUpdate::Processed),
            Err(ProgressError::NotInitialized)
        ));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_malformed_checkpoint_rejected() {
        let (_dir, store) = store();
        std::fs::write(store.path(), b"{\"run_id\": 7").unwrap();
        assert!(matches!(store.load(), Err(ProgressError::Format { .. })));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn counters_never_exceed_total(total in 0usize..40, outcomes in proptest::collection::vec(any::<bool>(), 0..60)) {
            let dir = tempfile::tempdir().unwrap();
            let store = ProgressStore::new(dir.path().join("p.json"));
            store.initialize(RotationProgress::new(
                Uuid::new_v4(),
                total,
                MasterKey::new("old", 1),
                MasterKey::new("new", 2),
            )).unwrap();

            for (i, ok) in outcomes.iter().enumerate() {
                let update = if *ok {
                    ProgressUpdate::Processed
                } else {
                    ProgressUpdate::Failed { record_id: format!("r{i}") }
                };
                let _ = store.update(update);
            }

            let p = store.current().unwrap();
            prop_assert!(p.processed_deks + p.failed_deks <= total);
            prop_assert_eq!(p.processed_deks + p.remaining() + p.failed_deks, total);
            prop_assert_eq!(p.failed_records.len(), p.failed_deks);
            let pct = p.progress_percentage();
            prop_assert!((0.0..=100.0).contains(&pct));
        }
    }
}
