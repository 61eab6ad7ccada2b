// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Configuration for rotation runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::AES_256_KEY_SIZE;

/// Default number of records verified after a run.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// How many rotated records are re-decrypted under the new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationSampling {
    /// Up to a fixed number of records.
    Fixed(usize),
    /// `per_mille` of the population, clamped to `min..=max`.
    Proportional {
        per_mille: u32,
        min: usize,
        max: usize,
    },
}

impl Default for VerificationSampling {
    fn default() -> Self {
        VerificationSampling::Fixed(DEFAULT_SAMPLE_SIZE)
    }
}

impl VerificationSampling {
    /// Sample size for a population of `total` records, never above `total`.
    pub fn sample_size(&self, total: usize) -> usize {
        let wanted = match *self {
            VerificationSampling::Fixed(n) => n,
            VerificationSampling::Proportional {
                per_mille,
                min,
                max,
            } => {
                let scaled = total.saturating_mul(per_mille as usize).div_ceil(1000);
                scaled.clamp(min, max.max(min))
            }
        };
        wanted.min(total)
    }
}

/// What to do with the old master key after a verified rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRetirement {
    Keep,
    Disable,
    ScheduleDeletion(Duration),
}

/// Tunables for [`RotationEngine`](super::RotationEngine).
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Rehearse the run without backend calls or record mutation.
    pub dry_run: bool,
    /// Maximum in-flight records (1 = sequential).
    pub concurrency: usize,
    /// Upper bound on every individual backend call.
    pub backend_timeout: Duration,
    /// Post-rotation verification sample.
    pub verification: VerificationSampling,
    /// Plaintext DEK length expected during verification.
    pub expected_dek_len: usize,
    /// Save the record set after this many rotated records (0 = only at the end).
    pub checkpoint_interval: usize,
    /// Description given to newly minted master keys.
    pub key_description: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: 1,
            backend_timeout: Duration::from_secs(30),
            verification: VerificationSampling::default(),
            expected_dek_len: AES_256_KEY_SIZE,
            checkpoint_interval: 100,
            key_description: "kekrotate master key".to_string(),
        }
    }
}

impl RotationConfig {
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the worker pool size. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_verification(mut self, sampling: VerificationSampling) -> Self {
        self.verification = sampling;
        self
    }

    pub fn with_expected_dek_len(mut self, len: usize) -> Self {
        self.expected_dek_len = len;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_key_description(mut self, description: impl Into<String>) -> Self {
        self.key_description = description.into();
        self
    }
}

/// State file locations under one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPaths {
    pub state_dir: PathBuf,
    pub progress: PathBuf,
    /// Checkpoint for dry runs, kept apart from real runs.
    pub dry_run_progress: PathBuf,
    pub audit_log: PathBuf,
    pub backups: PathBuf,
}

impl RotationPaths {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref().to_path_buf();
        Self {
            progress: state_dir.join("rotation_progress.json"),
            dry_run_progress: state_dir.join("rotation_progress.dry_run.json"),
            audit_log: state_dir.join("rotation_audit.jsonl"),
            backups: state_dir.join("backups"),
            state_dir,
        }
    }

    /// Checkpoint file used by a real or a dry run.
    pub fn progress_for(&self, dry_run: bool) -> &Path {
        if dry_run {
            &self.dry_run_progress
        } else {
            &self.progress
        }
    }
}
