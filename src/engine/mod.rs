// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Master key rotation engine.
//!
//! Re-wraps every DEK under a freshly issued (or caller-supplied) master key:
//!
//! 1. resolve the old key and obtain the new one
//! 2. load the record set and snapshot it with [`BackupManager`]
//! 3. initialize the checkpoint (`InProgress`)
//! 4. per record: decrypt under the old key, encrypt under the new key,
//!    update the record in place, update the checkpoint and audit log
//! 5. persist the record set, verify a sample under the new key
//! 6. finish as `Completed` or `Failed`
//!
//! A failure on one record never aborts the run. Backend calls may run in a
//! bounded pool, but records, checkpoint and audit log are only written from
//! the driving task. Interrupted runs continue with [`RotationEngine::resume`],
//! which skips records already wrapped by the new key.

mod config;
mod result;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use ring::digest;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use config::{
    KeyRetirement, RotationConfig, RotationPaths, VerificationSampling, DEFAULT_SAMPLE_SIZE,
};
pub use result::{RotationResult, VerificationOutcome};

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditStatus};
use crate::backend::{BackendError, KeyBackend, MasterKey};
use crate::backup::{BackupManager, BackupMetadata};
use crate::error::RotationError;
use crate::progress::{
    ProgressError, ProgressStore, ProgressUpdate, RotationProgress, RotationStatus,
};
use crate::records::{ensure_unique_ids, DekRecord, RecordStore};

/// Operator call-out attached to every rollback.
pub const ROLLBACK_LIMITATION: &str = "rollback restores DEK records only; master key changes \
made through disable_key or schedule_key_deletion are not undone";

/// Which keys a rotation run moves between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    /// Master key currently wrapping the DEKs.
    pub old_key_id: String,
    /// Existing master key to rotate to. A new key is minted when `None`.
    pub new_key_id: Option<String>,
}

impl RotationRequest {
    /// Rotates away from `old_key_id` to a freshly minted key.
    pub fn new(old_key_id: impl Into<String>) -> Self {
        Self {
            old_key_id: old_key_id.into(),
            new_key_id: None,
        }
    }

    /// Rotates to an existing key instead of minting one.
    pub fn with_new_key(mut self, new_key_id: impl Into<String>) -> Self {
        self.new_key_id = Some(new_key_id.into());
        self
    }
}

/// Keys and locations shared by a fresh run and a resumed one.
struct RunContext {
    run_id: Uuid,
    old_key: MasterKey,
    new_key: MasterKey,
    backup_location: PathBuf,
    dry_run: bool,
    started: Instant,
}

/// Backend output for one record.
struct Rewrapped {
    ciphertext: Vec<u8>,
    fingerprint: digest::Digest,
}

/// Drives rotation runs over one backend and one record store.
pub struct RotationEngine {
    backend: Arc<dyn KeyBackend>,
    store: Arc<dyn RecordStore>,
    audit: Arc<AuditLog>,
    progress: Arc<ProgressStore>,
    backups: Arc<BackupManager>,
    config: RotationConfig,
    cancel: CancellationToken,
}

impl RotationEngine {
    /// Assembles an engine from its stores.
    ///
    /// `progress` receives this engine's checkpoints. Dry-run engines should
    /// be given their own store; a dry run refuses to replace a real run's
    /// checkpoint.
    pub fn new(
        backend: Arc<dyn KeyBackend>,
        store: Arc<dyn RecordStore>,
        audit: Arc<AuditLog>,
        progress: Arc<ProgressStore>,
        backups: Arc<BackupManager>,
        config: RotationConfig,
    ) -> Self {
        Self {
            backend,
            store,
            audit,
            progress,
            backups,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Opens the audit log, checkpoint and backup directory under `paths`.
    ///
    /// Dry runs checkpoint to `paths.dry_run_progress`, leaving the real
    /// run's checkpoint untouched.
    pub fn open(
        backend: Arc<dyn KeyBackend>,
        store: Arc<dyn RecordStore>,
        paths: &RotationPaths,
        config: RotationConfig,
    ) -> Result<Self, RotationError> {
        std::fs::create_dir_all(&paths.state_dir)?;
        Ok(Self::new(
            backend,
            store,
            Arc::new(AuditLog::open(&paths.audit_log)?),
            Arc::new(ProgressStore::new(paths.progress_for(config.dry_run))),
            Arc::new(BackupManager::new(&paths.backups)?),
            config,
        ))
    }

    /// Replaces the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that interrupts the current run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Loads the current checkpoint, if any.
    pub fn status(&self) -> Result<Option<RotationProgress>, RotationError> {
        Ok(self.progress.load()?)
    }

    /// Lists backup files, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, RotationError> {
        Ok(self.backups.list_backups()?)
    }

    /// Runs a full rotation from `request.old_key_id` to a new master key.
    ///
    /// Errors are returned only when the run cannot proceed at all (unknown
    /// keys, a blocking checkpoint, unreadable records, failed backup or
    /// state writes). Per-record failures, verification failure and
    /// cancellation are reported through the returned [`RotationResult`].
    #[instrument(skip(self, request), fields(old_key = %request.old_key_id, dry_run = self.config.dry_run))]
    pub async fn rotate(&self, request: RotationRequest) -> Result<RotationResult, RotationError> {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, backend = self.backend.name(), "Starting master key rotation");

        self.audit.log(
            AuditEvent::new(AuditAction::RotationStarted, AuditStatus::Started)
                .with_run(run_id)
                .with_detail("old_key_id", request.old_key_id.as_str())
                .with_detail("backend", self.backend.name())
                .with_detail("dry_run", self.config.dry_run),
        )?;

        match self.start_run(run_id, &request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Rotation aborted");
                self.audit_failure(AuditAction::RotationFailed, run_id, &e);
                Err(e)
            }
        }
    }

    async fn start_run(
        &self,
        run_id: Uuid,
        request: &RotationRequest,
    ) -> Result<RotationResult, RotationError> {
        let started = Instant::now();
        let dry_run = self.config.dry_run;

        if let Some(existing) = self.progress.load()? {
            if existing.status.is_active() && !existing.dry_run {
                return Err(RotationError::RunInProgress {
                    run_id: existing.run_id,
                    status: existing.status,
                });
            }
            if dry_run && !existing.dry_run {
                return Err(RotationError::InvalidRequest(format!(
                    "dry run would replace the checkpoint of run {}",
                    existing.run_id
                )));
            }
        }

        let (old_key, new_key) = self.resolve_keys(run_id, request).await?;

        let records = self.store.load().await?;
        ensure_unique_ids(&records)?;
        let pending = pending_indices(&records, &old_key.key_id);
        let skipped = records.len() - pending.len();
        if skipped > 0 {
            warn!(
                skipped,
                "Records wrapped by neither the old nor the new key are left untouched"
            );
        }

        let backup_location = self.backups.create_backup(
            &records,
            &BackupMetadata {
                run_id,
                old_key_id: old_key.key_id.clone(),
                new_key_id: new_key.key_id.clone(),
            },
        )?;
        self.audit.log(
            AuditEvent::new(AuditAction::BackupCreated, AuditStatus::Success)
                .with_run(run_id)
                .with_detail("path", backup_location.display().to_string())
                .with_detail("records", records.len()),
        )?;

        let progress = RotationProgress::new(
            run_id,
            pending.len(),
            old_key.clone(),
            new_key.clone(),
        )
        .with_dry_run(dry_run)
        .with_backup_location(&backup_location);
        self.progress.initialize(progress)?;
        self.audit.log(
            AuditEvent::new(AuditAction::ProgressInitialized, AuditStatus::Success)
                .with_run(run_id)
                .with_detail("total_deks", pending.len())
                .with_detail("skipped", skipped),
        )?;

        let run = RunContext {
            run_id,
            old_key,
            new_key,
            backup_location,
            dry_run,
            started,
        };
        self.execute(&run, records, pending).await
    }

    /// Continues the interrupted run recorded in the checkpoint.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<RotationResult, RotationError> {
        if self.config.dry_run {
            return Err(RotationError::InvalidRequest(
                "an interrupted run cannot be resumed as a dry run".into(),
            ));
        }

        let checkpoint = self
            .progress
            .load()?
            .filter(|p| p.status.is_active() && !p.dry_run)
            .ok_or(RotationError::NoResumableRun)?;
        let run_id = checkpoint.run_id;

        match self.resume_run(checkpoint).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Resume aborted");
                self.audit_failure(AuditAction::RotationFailed, run_id, &e);
                Err(e)
            }
        }
    }

    async fn resume_run(&self, checkpoint: RotationProgress) -> Result<RotationResult, RotationError> {
        let started = Instant::now();
        let backup_location =
            checkpoint
                .backup_location
                .clone()
                .ok_or_else(|| RotationError::ChecksumOrFormat {
                    path: self.progress.path().to_path_buf(),
                    reason: "checkpoint has no backup location".into(),
                })?;

        // Both keys must still exist before anything is touched.
        self.call(self.backend.get_master_key(&checkpoint.old_key.key_id))
            .await?;
        self.call(self.backend.get_master_key(&checkpoint.new_key.key_id))
            .await?;

        let records = self.store.load().await?;
        ensure_unique_ids(&records)?;
        let already_rotated = records
            .iter()
            .filter(|r| r.is_wrapped_by(&checkpoint.new_key.key_id))
            .count();
        let pending = pending_indices(&records, &checkpoint.old_key.key_id);

        let mut progress = checkpoint;
        progress.total_deks = already_rotated + pending.len();
        progress.processed_deks = already_rotated;
        progress.failed_deks = 0;
        progress.failed_records.clear();
        progress.status = RotationStatus::InProgress;
        progress.end_time = None;
        let progress = self.progress.checkpoint(progress)?;

        info!(
            run_id = %progress.run_id,
            already_rotated,
            remaining = pending.len(),
            "Resuming master key rotation"
        );
        self.audit.log(
            AuditEvent::new(AuditAction::RotationResumed, AuditStatus::Started)
                .with_run(progress.run_id)
                .with_detail("already_rotated", already_rotated)
                .with_detail("remaining", pending.len()),
        )?;

        let run = RunContext {
            run_id: progress.run_id,
            old_key: progress.old_key,
            new_key: progress.new_key,
            backup_location,
            dry_run: false,
            started,
        };
        self.execute(&run, records, pending).await
    }

    async fn resolve_keys(
        &self,
        run_id: Uuid,
        request: &RotationRequest,
    ) -> Result<(MasterKey, MasterKey), RotationError> {
        if request.new_key_id.as_deref() == Some(request.old_key_id.as_str()) {
            return Err(RotationError::InvalidRequest(
                "new key must differ from the old key".into(),
            ));
        }

        if self.config.dry_run {
            let old_key = MasterKey::new(&request.old_key_id, 0);
            let new_key = match &request.new_key_id {
                Some(id) => MasterKey::new(id, 0),
                None => MasterKey::new(format!("dry-run-{}", Uuid::new_v4()), 0)
                    .with_description("synthetic dry-run key"),
            };
            self.audit.log(
                AuditEvent::new(AuditAction::KeyResolved, AuditStatus::Success)
                    .with_run(run_id)
                    .with_detail("old_key_id", old_key.key_id.as_str())
                    .with_detail("new_key_id", new_key.key_id.as_str())
                    .with_detail("synthetic", true),
            )?;
            return Ok((old_key, new_key));
        }

        let old_key = self
            .call(self.backend.get_master_key(&request.old_key_id))
            .await?;
        self.audit.log(
            AuditEvent::new(AuditAction::KeyResolved, AuditStatus::Success)
                .with_run(run_id)
                .with_detail("key_id", old_key.key_id.as_str())
                .with_detail("version", old_key.version),
        )?;

        let new_key = match &request.new_key_id {
            Some(id) => {
                let key = self.call(self.backend.get_master_key(id)).await?;
                self.audit.log(
                    AuditEvent::new(AuditAction::KeyResolved, AuditStatus::Success)
                        .with_run(run_id)
                        .with_detail("key_id", key.key_id.as_str())
                        .with_detail("version", key.version),
                )?;
                key
            }
            None => {
                let key = self
                    .call(self.backend.create_master_key(&self.config.key_description))
                    .await?;
                self.audit.log(
                    AuditEvent::new(AuditAction::KeyCreated, AuditStatus::Success)
                        .with_run(run_id)
                        .with_detail("key_id", key.key_id.as_str())
                        .with_detail("version", key.version),
                )?;
                key
            }
        };

        info!(
            old_key = %old_key.key_id,
            new_key = %new_key.key_id,
            new_version = new_key.version,
            "Resolved master keys"
        );
        Ok((old_key, new_key))
    }

    /// Processes `pending`, persists, verifies and finishes the run.
    async fn execute(
        &self,
        run: &RunContext,
        mut records: Vec<DekRecord>,
        pending: Vec<usize>,
    ) -> Result<RotationResult, RotationError> {
        let old_id = run.old_key.key_id.as_str();
        let new_id = run.new_key.key_id.as_str();
        let dry_run = run.dry_run;

        let jobs: Vec<(usize, Vec<u8>)> = pending
            .iter()
            .map(|&idx| (idx, records[idx].encrypted_dek.clone()))
            .collect();
        let in_flight = Mutex::new(HashSet::new());
        let mut fingerprints = HashMap::new();
        let mut unsaved = 0usize;
        let mut cancelled = false;

        let stream = stream::iter(jobs)
            .inspect(|(idx, _)| {
                in_flight.lock().insert(*idx);
            })
            .map(move |(idx, ciphertext)| async move {
                let outcome = if dry_run {
                    Ok(None)
                } else {
                    self.rewrap(&ciphertext, old_id, new_id).await.map(Some)
                };
                (idx, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1));
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = stream.next() => next,
            };
            let Some((idx, outcome)) = next else {
                break;
            };
            in_flight.lock().remove(&idx);

            match outcome {
                Ok(rewrapped) => {
                    let record = &mut records[idx];
                    if let Some(Rewrapped {
                        ciphertext,
                        fingerprint,
                    }) = rewrapped
                    {
                        record.apply_rotation(ciphertext, new_id);
                        fingerprints.insert(idx, fingerprint);
                        unsaved += 1;
                    }
                    self.progress.update(ProgressUpdate::Processed)?;
                    self.audit.log(
                        AuditEvent::new(AuditAction::DekRotated, AuditStatus::Success)
                            .with_run(run.run_id)
                            .with_detail("record_id", record.record_id.as_str())
                            .with_detail("key_version", record.key_version)
                            .with_detail("dry_run", dry_run),
                    )?;
                }
                Err(e) => {
                    let record_id = records[idx].record_id.clone();
                    warn!(record_id = %record_id, error = %e, "Failed to rotate DEK");
                    self.record_failure(run.run_id, record_id, &e.to_string())?;
                }
            }

            if !dry_run
                && self.config.checkpoint_interval > 0
                && unsaved >= self.config.checkpoint_interval
            {
                self.persist_records(run.run_id, &records).await?;
                unsaved = 0;
            }
        }

        if cancelled {
            let mut interrupted: Vec<usize> = in_flight.lock().drain().collect();
            interrupted.sort_unstable();
            for idx in interrupted {
                self.record_failure(run.run_id, records[idx].record_id.clone(), "cancelled")?;
            }
            if !dry_run {
                self.persist_records(run.run_id, &records).await?;
            }

            let progress = self.current_progress()?;
            warn!(
                run_id = %run.run_id,
                processed = progress.processed_deks,
                total = progress.total_deks,
                "Rotation cancelled; resume to finish"
            );
            self.audit.log(
                AuditEvent::new(AuditAction::RotationCancelled, AuditStatus::Warning)
                    .with_run(run.run_id)
                    .with_detail("processed", progress.processed_deks)
                    .with_detail("failed", progress.failed_deks)
                    .with_detail("total", progress.total_deks),
            )?;
            return Ok(self.build_result(
                run,
                &progress,
                None,
                Some(RotationError::Cancelled.to_string()),
            ));
        }

        if !dry_run {
            self.persist_records(run.run_id, &records).await?;
        }

        let progress = self.progress.set_status(RotationStatus::Verifying)?;
        self.audit.log(
            AuditEvent::new(AuditAction::VerificationStarted, AuditStatus::Started)
                .with_run(run.run_id),
        )?;

        let verification = if dry_run {
            VerificationOutcome {
                passed: true,
                sampled: self.config.verification.sample_size(progress.processed_deks),
                failures: Vec::new(),
            }
        } else {
            self.verify(&records, new_id, &fingerprints, progress.total_deks)
                .await
        };
        self.audit.log(
            AuditEvent::new(
                AuditAction::VerificationCompleted,
                if verification.passed {
                    AuditStatus::Success
                } else {
                    AuditStatus::Failure
                },
            )
            .with_run(run.run_id)
            .with_detail("sampled", verification.sampled)
            .with_detail("failures", verification.failures.len()),
        )?;

        let status = if verification.passed {
            RotationStatus::Completed
        } else {
            RotationStatus::Failed
        };
        let progress = self.progress.complete(status)?;

        let error = if !verification.passed {
            Some(
                RotationError::VerificationFailed {
                    sampled: verification.sampled,
                    failures: verification.failures.len(),
                }
                .to_string(),
            )
        } else if progress.failed_deks > 0 {
            Some(format!("{} DEK records failed to rotate", progress.failed_deks))
        } else {
            None
        };

        let result = self.build_result(run, &progress, Some(verification), error);
        let (action, audit_status) = if status == RotationStatus::Completed {
            (AuditAction::RotationCompleted, AuditStatus::Success)
        } else {
            (AuditAction::RotationFailed, AuditStatus::Failure)
        };
        self.audit.log(
            AuditEvent::new(action, audit_status)
                .with_run(run.run_id)
                .with_detail("deks_rotated", result.deks_rotated)
                .with_detail("deks_failed", result.deks_failed)
                .with_detail("success", result.success),
        )?;

        info!(
            run_id = %run.run_id,
            status = %status,
            rotated = result.deks_rotated,
            failed = result.deks_failed,
            duration_ms = result.duration.as_millis() as u64,
            "Master key rotation finished"
        );
        Ok(result)
    }

    /// Decrypts under the old key and encrypts under the new one. The
    /// plaintext is dropped, and zeroed, before this returns.
    async fn rewrap(
        &self,
        ciphertext: &[u8],
        old_key_id: &str,
        new_key_id: &str,
    ) -> Result<Rewrapped, BackendError> {
        let plaintext = self
            .call(self.backend.decrypt_dek(ciphertext, old_key_id))
            .await?;
        let fingerprint = digest::digest(&digest::SHA256, &plaintext);
        let ciphertext = self
            .call(self.backend.encrypt_dek(&plaintext, new_key_id))
            .await?;
        Ok(Rewrapped {
            ciphertext,
            fingerprint,
        })
    }

    /// Re-decrypts the first rotated records under the new key.
    async fn verify(
        &self,
        records: &[DekRecord],
        new_key_id: &str,
        fingerprints: &HashMap<usize, digest::Digest>,
        total: usize,
    ) -> VerificationOutcome {
        let rotated: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_wrapped_by(new_key_id))
            .map(|(idx, _)| idx)
            .collect();
        let sampled = self.config.verification.sample_size(rotated.len());
        let mut failures = Vec::new();

        for &idx in rotated.iter().take(sampled) {
            let record = &records[idx];
            let reason = match self
                .call(self.backend.decrypt_dek(&record.encrypted_dek, new_key_id))
                .await
            {
                Ok(plaintext) if plaintext.len() != self.config.expected_dek_len => Some(format!(
                    "plaintext is {} bytes, expected {}",
                    plaintext.len(),
                    self.config.expected_dek_len
                )),
                Ok(plaintext) => {
                    let actual = digest::digest(&digest::SHA256, &plaintext);
                    match fingerprints.get(&idx) {
                        Some(expected) if expected.as_ref() != actual.as_ref() => {
                            Some("plaintext differs from the pre-rotation DEK".to_string())
                        }
                        _ => None,
                    }
                }
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                warn!(record_id = %record.record_id, reason = %reason, "Verification failed");
                failures.push((record.record_id.clone(), reason));
            }
        }

        VerificationOutcome {
            passed: failures.is_empty() && (sampled > 0 || total == 0),
            sampled,
            failures,
        }
    }

    /// Restores the record set from a backup.
    ///
    /// Master key lifecycle changes are not undone; the result carries a
    /// warning saying so.
    #[instrument(skip(self), fields(backup = %backup.display()))]
    pub async fn rollback(&self, backup: &Path) -> Result<RotationResult, RotationError> {
        let started = Instant::now();
        let (metadata, records) = match self.backups.restore(backup) {
            Ok(restored) => restored,
            Err(e) => {
                let e = RotationError::from(e);
                error!(error = %e, "Rollback aborted: unreadable backup");
                if let Err(audit_err) = self.audit.log(
                    AuditEvent::new(AuditAction::RollbackFailed, AuditStatus::Failure)
                        .with_detail("backup", backup.display().to_string())
                        .with_error(&e),
                ) {
                    error!(error = %audit_err, "Failed to write audit event");
                }
                return Err(e);
            }
        };
        let run_id = metadata.run_id;

        self.audit.log(
            AuditEvent::new(AuditAction::RollbackStarted, AuditStatus::Started)
                .with_run(run_id)
                .with_detail("backup", backup.display().to_string())
                .with_detail("records", records.len()),
        )?;

        match self.restore(backup, metadata, records).await {
            Ok(mut result) => {
                result.duration = started.elapsed();
                Ok(result)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Rollback failed");
                self.audit_failure(AuditAction::RollbackFailed, run_id, &e);
                Err(e)
            }
        }
    }

    async fn restore(
        &self,
        backup: &Path,
        metadata: BackupMetadata,
        records: Vec<DekRecord>,
    ) -> Result<RotationResult, RotationError> {
        self.store.save(&records).await?;

        if let Some(progress) = self.progress.load()? {
            if progress.run_id == metadata.run_id
                && progress.status.can_transition_to(RotationStatus::RolledBack)
            {
                self.progress.set_status(RotationStatus::RolledBack)?;
            } else if progress.status.is_active() && !progress.dry_run {
                warn!(
                    checkpoint_run = %progress.run_id,
                    "Checkpoint belongs to another run and is left unchanged"
                );
            }
        }

        warn!("{ROLLBACK_LIMITATION}");
        self.audit.log(
            AuditEvent::new(AuditAction::RollbackCompleted, AuditStatus::Warning)
                .with_run(metadata.run_id)
                .with_detail("records_restored", records.len())
                .with_detail("warning", ROLLBACK_LIMITATION),
        )?;
        info!(
            run_id = %metadata.run_id,
            restored = records.len(),
            "Rollback complete"
        );

        Ok(RotationResult {
            success: true,
            run_id: metadata.run_id,
            status: RotationStatus::RolledBack,
            old_key_id: metadata.old_key_id,
            new_key_id: metadata.new_key_id,
            deks_rotated: 0,
            deks_failed: 0,
            failed_records: Vec::new(),
            duration: std::time::Duration::ZERO,
            backup_location: Some(backup.to_path_buf()),
            audit_log_location: self.audit.path().to_path_buf(),
            verification: None,
            error: None,
            dry_run: false,
            warnings: vec![ROLLBACK_LIMITATION.to_string()],
        })
    }

    /// Disables or schedules deletion of the old key after a verified run.
    #[instrument(skip(self, result), fields(old_key = %result.old_key_id))]
    pub async fn retire_old_key(
        &self,
        result: &RotationResult,
        retirement: KeyRetirement,
    ) -> Result<(), RotationError> {
        if !result.success || result.dry_run || result.status != RotationStatus::Completed {
            return Err(RotationError::InvalidRequest(
                "old key can only be retired after a successful, verified rotation".into(),
            ));
        }

        let key_id = result.old_key_id.as_str();
        let (action, outcome) = match retirement {
            KeyRetirement::Keep => return Ok(()),
            KeyRetirement::Disable => (
                AuditAction::KeyDisabled,
                self.call(self.backend.disable_key(key_id)).await,
            ),
            KeyRetirement::ScheduleDeletion(grace) => (
                AuditAction::KeyDeletionScheduled,
                self.call(self.backend.schedule_key_deletion(key_id, grace))
                    .await,
            ),
        };

        match outcome {
            Ok(()) => {
                info!(key_id, action = action.as_str(), "Retired old master key");
                self.audit.log(
                    AuditEvent::new(action, AuditStatus::Success)
                        .with_run(result.run_id)
                        .with_detail("key_id", key_id),
                )?;
                Ok(())
            }
            Err(e) => {
                let e = RotationError::from(e);
                self.audit_failure(action, result.run_id, &e);
                Err(e)
            }
        }
    }

    /// Bounds one backend call by the configured timeout.
    async fn call<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let limit = self.config.backend_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        }
    }

    fn record_failure(
        &self,
        run_id: Uuid,
        record_id: String,
        reason: &str,
    ) -> Result<(), RotationError> {
        self.audit.log(
            AuditEvent::new(AuditAction::DekRotationFailed, AuditStatus::Failure)
                .with_run(run_id)
                .with_detail("record_id", record_id.as_str())
                .with_error(reason),
        )?;
        self.progress
            .update(ProgressUpdate::Failed { record_id })?;
        Ok(())
    }

    async fn persist_records(
        &self,
        run_id: Uuid,
        records: &[DekRecord],
    ) -> Result<(), RotationError> {
        self.store.save(records).await?;
        self.audit.log(
            AuditEvent::new(AuditAction::RecordsPersisted, AuditStatus::Success)
                .with_run(run_id)
                .with_detail("records", records.len())
                .with_detail("location", self.store.location()),
        )?;
        Ok(())
    }

    fn current_progress(&self) -> Result<RotationProgress, RotationError> {
        self.progress
            .current()
            .ok_or(RotationError::Progress(ProgressError::NotInitialized))
    }

    fn build_result(
        &self,
        run: &RunContext,
        progress: &RotationProgress,
        verification: Option<VerificationOutcome>,
        error: Option<String>,
    ) -> RotationResult {
        RotationResult {
            success: progress.status == RotationStatus::Completed
                && progress.failed_deks == 0
                && error.is_none(),
            run_id: run.run_id,
            status: progress.status,
            old_key_id: run.old_key.key_id.clone(),
            new_key_id: run.new_key.key_id.clone(),
            deks_rotated: progress.processed_deks,
            deks_failed: progress.failed_deks,
            failed_records: progress.failed_records.clone(),
            duration: run.started.elapsed(),
            backup_location: Some(run.backup_location.clone()),
            audit_log_location: self.audit.path().to_path_buf(),
            verification,
            error,
            dry_run: run.dry_run,
            warnings: Vec::new(),
        }
    }

    fn audit_failure(&self, action: AuditAction, run_id: Uuid, err: &RotationError) {
        let event = AuditEvent::new(action, AuditStatus::Failure)
            .with_run(run_id)
            .with_error(err);
        if let Err(audit_err) = self.audit.log(event) {
            error!(error = %audit_err, "Failed to write audit event");
        }
    }
}

/// Indices of records still wrapped by the old key, in load order.
/// Records without a key id predate key tracking and count as old.
fn pending_indices(records: &[DekRecord], old_key_id: &str) -> Vec<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, r)| match r.key_id.as_deref() {
            None => true,
            Some(id) => id == old_key_id,
        })
        .map(|(idx, _)| idx)
        .collect()
}
