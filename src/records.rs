// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! DEK records and the stores that hold them.
//!
//! The engine loads the complete record set from a [`RecordStore`], mutates
//! it in memory and hands the complete set back. Stores must make `save`
//! all-or-nothing from the caller's point of view.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::durable::write_atomic;

/// One protected data encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DekRecord {
    /// Correlates the DEK with the location of the data it protects.
    pub record_id: String,
    /// Backend ciphertext of the DEK. Base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub encrypted_dek: Vec<u8>,
    /// Version of the KEK generation that wrapped this DEK.
    pub key_version: u32,
    /// Master key that wrapped `encrypted_dek`. `None` on records written
    /// before key ids were tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_rotated: Option<DateTime<Utc>>,
}

impl DekRecord {
    /// Creates a record that has never been rotated.
    pub fn new(record_id: impl Into<String>, encrypted_dek: Vec<u8>, key_version: u32) -> Self {
        Self {
            record_id: record_id.into(),
            encrypted_dek,
            key_version,
            key_id: None,
            created_at: Utc::now(),
            last_rotated: None,
        }
    }

    /// Sets the wrapping key id.
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Returns true if the ciphertext is known to be wrapped by `key_id`.
    pub fn is_wrapped_by(&self, key_id: &str) -> bool {
        self.key_id.as_deref() == Some(key_id)
    }

    /// Replaces the ciphertext with one produced under `new_key_id`.
    pub(crate) fn apply_rotation(&mut self, ciphertext: Vec<u8>, new_key_id: &str) {
        self.encrypted_dek = ciphertext;
        self.key_version = self.key_version.saturating_add(1);
        self.key_id = Some(new_key_id.to_string());
        self.last_rotated = Some(Utc::now());
    }
}

/// Errors raised by record stores.
#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("I/O error on record store: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record store {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("duplicate record id: {0}")]
    DuplicateRecord(String),
}

/// Source and sink of the DEK record set.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the complete, ordered set of records.
    async fn load(&self) -> Result<Vec<DekRecord>, RecordStoreError>;

    /// Replaces the stored set with `records`, all or nothing.
    async fn save(&self, records: &[DekRecord]) -> Result<(), RecordStoreError>;

    /// Human-readable location for logs and reports.
    fn location(&self) -> String;
}

/// Checks that every record id appears once.
pub fn ensure_unique_ids(records: &[DekRecord]) -> Result<(), RecordStoreError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.record_id.as_str()) {
            return Err(RecordStoreError::DuplicateRecord(record.record_id.clone()));
        }
    }
    Ok(())
}

/// Records kept as a JSON array in a single file.
///
/// Saves write a sibling temporary file and rename it over the target.
#[derive(Debug, Clone)]
pub struct JsonFileRecordStore {
    path: PathBuf,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn load(&self) -> Result<Vec<DekRecord>, RecordStoreError> {
        let bytes = std::fs::read(&self.path)?;
        let records: Vec<DekRecord> =
            serde_json::from_slice(&bytes).map_err(|e| RecordStoreError::Format {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        ensure_unique_ids(&records)?;

        debug!(path = %self.path.display(), count = records.len(), "Loaded DEK records");
        Ok(records)
    }

    async fn save(&self, records: &[DekRecord]) -> Result<(), RecordStoreError> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| RecordStoreError::Format {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &json)?;

        debug!(path = %self.path.display(), count = records.len(), "Saved DEK records");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<DekRecord>>,
}

impl MemoryRecordStore {
    pub fn new(records: Vec<DekRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Returns a copy of the current records.
    pub fn snapshot(&self) -> Vec<DekRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self) -> Result<Vec<DekRecord>, RecordStoreError> {
        Ok(self.snapshot())
    }

    async fn save(&self, records: &[DekRecord]) -> Result<(), RecordStoreError> {
        *self.records.write() = records.to_vec();
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_rotation() {
        let mut record = DekRecord::new("orders/1", vec![1, 2, 3], 1).with_key_id("kek-old");
        assert!(record.is_wrapped_by("kek-old"));
        assert!(record.last_rotated.is_none());

        record.apply_rotation(vec![4, 5, 6], "kek-new");

        assert_eq!(record.encrypted_dek, vec![4, 5, 6]);
        assert_eq!(record.key_version, 2);
        assert!(record.is_wrapped_by("kek-new"));
        assert!(record.last_rotated.is_some());
    }

    #[test]
    fn test_ciphertext_is_base64_in_json() {
        let record = DekRecord::new("a", vec![0xde, 0xad, 0xbe, 0xef], 1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["encrypted_dek"], "3q2+7w==");
        assert!(json.get("key_id").is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let records = vec![
            DekRecord::new("a", vec![1], 1),
            DekRecord::new("b", vec![2], 1),
            DekRecord::new("a", vec![3], 1),
        ];
        assert!(matches!(
            ensure_unique_ids(&records),
            Err(RecordStoreError::DuplicateRecord(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_json_file_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRecordStore::new(dir.path().join("deks.json"));
        let records = vec![
            DekRecord::new("a", vec![1, 2], 1),
            DekRecord::new("b", vec![3, 4], 1).with_key_id("kek-1"),
        ];

        store.save(&records).await.unwrap();
        assert_eq!(store.load().await.unwrap(), records);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deks.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileRecordStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(RecordStoreError::Format { .. })
        ));
    }
}
