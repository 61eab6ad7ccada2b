// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Terminal run summaries.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::progress::RotationStatus;

/// Outcome of post-rotation verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub sampled: usize,
    /// Record ids that failed verification, with the reason.
    pub failures: Vec<(String, String)>,
}

/// Summary returned once per rotation, resume or rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationResult {
    pub success: bool,
    pub run_id: Uuid,
    pub status: RotationStatus,
    pub old_key_id: String,
    pub new_key_id: String,
    pub deks_rotated: usize,
    pub deks_failed: usize,
    pub failed_records: Vec<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub backup_location: Option<PathBuf>,
    pub audit_log_location: PathBuf,
    pub verification: Option<VerificationOutcome>,
    pub error: Option<String>,
    pub dry_run: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RotationResult {
    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_serialized_as_seconds() {
        let result = RotationResult {
            success: true,
            run_id: Uuid::nil(),
            status: RotationStatus::Completed,
            old_key_id: "kek-1".into(),
            new_key_id: "kek-2".into(),
            deks_rotated: 3,
            deks_failed: 0,
            failed_records: Vec::new(),
            duration: Duration::from_millis(1500),
            backup_location: None,
            audit_log_location: PathBuf::from("audit.jsonl"),
            verification: None,
            error: None,
            dry_run: false,
            warnings: Vec::new(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1.5);
        assert_eq!(json["status"], "completed");
        assert_eq!(result.exit_code(), 0);
    }
}
