// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Immutable snapshots of the DEK record set.
//!
//! A backup is taken before a run mutates anything. It is a single JSON
//! document keyed by record id, carrying a SHA-256 checksum over the
//! records. Backups are written once with no-clobber semantics, made
//! read-only and only ever read again during rollback.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;
use uuid::Uuid;

use crate::records::DekRecord;

/// Current backup document layout.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

const BACKUP_PREFIX: &str = "dek_backup_";

/// Run context stored alongside the records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub run_id: Uuid,
    pub old_key_id: String,
    pub new_key_id: String,
}

/// On-disk backup document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: BackupMetadata,
    pub record_count: usize,
    /// Hex SHA-256 over the canonical JSON of `records`.
    pub checksum: String,
    pub records: BTreeMap<String, DekRecord>,
}

impl BackupDocument {
    /// Returns the records ordered by record id.
    pub fn into_records(self) -> Vec<DekRecord> {
        self.records.into_values().collect()
    }
}

/// Errors raised while writing or reading backups.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backup {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("backup checksum mismatch in {path}")]
    Checksum { path: PathBuf },

    #[error("duplicate record id in backup: {0}")]
    DuplicateRecord(String),
}

/// Creates and reads record-set backups in one directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    /// Uses `dir` for backups, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Snapshots `records` to a new timestamped file and returns its path.
    pub fn create_backup(
        &self,
        records: &[DekRecord],
        metadata: &BackupMetadata,
    ) -> Result<PathBuf, BackupError> {
        let mut keyed = BTreeMap::new();
        for record in records {
            if keyed
                .insert(record.record_id.clone(), record.clone())
                .is_some()
            {
                return Err(BackupError::DuplicateRecord(record.record_id.clone()));
            }
        }

        let created_at = Utc::now();
        let path = self.dir.join(format!(
            "{BACKUP_PREFIX}{}_{}.json",
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            metadata.run_id
        ));

        let document = BackupDocument {
            format_version: BACKUP_FORMAT_VERSION,
            created_at,
            metadata: metadata.clone(),
            record_count: keyed.len(),
            checksum: checksum(&keyed, &path)?,
            records: keyed,
        };
        let json = serde_json::to_vec_pretty(&document).map_err(|e| BackupError::Format {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&path).map_err(|e| e.error)?;

        let mut permissions = fs::metadata(&path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions)?;

        info!(
            path = %path.display(),
            records = document.record_count,
            run_id = %metadata.run_id,
            "Created DEK backup"
        );
        Ok(path)
    }

    /// Reads and validates a backup document.
    pub fn load_backup(path: impl AsRef<Path>) -> Result<BackupDocument, BackupError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let document: BackupDocument =
            serde_json::from_slice(&bytes).map_err(|e| BackupError::Format {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if document.format_version != BACKUP_FORMAT_VERSION {
            return Err(BackupError::Format {
                path: path.to_path_buf(),
                reason: format!("unsupported format version {}", document.format_version),
            });
        }
        if document.record_count != document.records.len() {
            return Err(BackupError::Format {
                path: path.to_path_buf(),
                reason: format!(
                    "record count {} does not match {} records",
                    document.record_count,
                    document.records.len()
                ),
            });
        }
        if let Some((key, record)) = document
            .records
            .iter()
            .find(|(key, record)| **key != record.record_id)
        {
            return Err(BackupError::Format {
                path: path.to_path_buf(),
                reason: format!("entry {key} holds record {}", record.record_id),
            });
        }
        if checksum(&document.records, path)? != document.checksum {
            return Err(BackupError::Checksum {
                path: path.to_path_buf(),
            });
        }

        Ok(document)
    }

    /// Validates `path` and returns its run metadata with the records
    /// ordered by record id.
    pub fn restore(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(BackupMetadata, Vec<DekRecord>), BackupError> {
        let path = path.as_ref();
        let document = Self::load_backup(path)?;
        let metadata = document.metadata.clone();
        let records = document.into_records();
        info!(
            path = %path.display(),
            run_id = %metadata.run_id,
            records = records.len(),
            "Backup validated for restore"
        );
        Ok((metadata, records))
    }

    /// Lists backup files, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, BackupError> {
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
            })
            .collect();
        backups.sort();
        backups.reverse();
        Ok(backups)
    }
}

fn checksum(records: &BTreeMap<String, DekRecord>, path: &Path) -> Result<String, BackupError> {
    let canonical = serde_json::to_vec(records).map_err(|e| BackupError::Format {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let digest = digest::digest(&digest::SHA256, &canonical);
    Ok(digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> BackupMetadata {
        BackupMetadata {
            run_id: Uuid::new_v4(),
            old_key_id: "kek-old".into(),
            new_key_id: "kek-new".into(),
        }
    }

    fn records() -> Vec<DekRecord> {
        vec![
            DekRecord::new("b", vec![2; 60], 1),
            DekRecord::new("a", vec![1; 60], 1),
            DekRecord::new("c", vec![3; 60], 1),
        ]
    }

    #[test]
    fn test_backup_round_trip_keyed_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups")).unwrap();
        let meta = metadata();
        let records = records();

        let path = manager.create_backup(&records, &meta).unwrap();
        let document = BackupManager::load_backup(&path).unwrap();

        assert_eq!(document.metadata, meta);
        assert_eq!(document.record_count, 3);
        assert_eq!(
            document.records.keys().cloned().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(document.records["b"], records[0]);
    }

    #[test]
    fn test_restore_returns_records_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path()).unwrap();
        let meta = metadata();
        let records = records();
        let path = manager.create_backup(&records, &meta).unwrap();

        let (restored_meta, restored) = manager.restore(&path).unwrap();

        assert_eq!(restored_meta, meta);
        assert_eq!(
            restored.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(restored[0], records[1]);
    }

    #[test]
    fn test_backup_is_read_only_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path()).unwrap();

        let first = manager.create_backup(&records(), &metadata()).unwrap();
        let second = manager.create_backup(&records(), &metadata()).unwrap();

        assert_ne!(first, second);
        assert!(fs::metadata(&first).unwrap().permissions().readonly());
        assert_eq!(manager.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn test_tampered_backup_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path()).unwrap();
        let path = manager.create_backup(&records(), &metadata()).unwrap();

        let mut document: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        document["records"]["a"]["key_version"] = serde_json::json!(9);

        let mut permissions = fs::metadata(&path).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(&path, permissions).unwrap();
        fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

        assert!(matches!(
            BackupManager::load_backup(&path),
            Err(BackupError::Checksum { .. })
        ));
    }

    #[test]
    fn test_garbage_backup_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dek_backup_bad.json");
        fs::write(&path, b"[]").unwrap();

        assert!(matches!(
            BackupManager::load_backup(&path),
            Err(BackupError::Format { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path()).unwrap();
        let mut dupes = records();
        dupes.push(DekRecord::new("a", vec![9], 1));

        assert!(matches!(
            manager.create_backup(&dupes, &metadata()),
            Err(BackupError::DuplicateRecord(id)) if id == "a"
        ));
    }
}
