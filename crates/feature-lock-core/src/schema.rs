use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A row of the `locks` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    pub id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRow {
    /// Whether the lock has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Which per-lock record relation to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Locked,
    Failed,
}

/// The three lock relations, held together.
///
/// `locked_records` is keyed by record id, which is the uniqueness
/// constraint: a record can be mapped to at most one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tables {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    locks: BTreeMap<String, LockRow>,
    /// record_id -> lock_id
    #[serde(default)]
    locked_records: BTreeMap<String, String>,
    /// (lock_id, record_id)
    #[serde(default)]
    failed_records: BTreeSet<(String, String)>,
}

fn default_version() -> u32 {
    1
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    pub fn new() -> Self {
        Self {
            version: default_version(),
            locks: BTreeMap::new(),
            locked_records: BTreeMap::new(),
            failed_records: BTreeSet::new(),
        }
    }

    pub fn lock(&self, lock_id: &str) -> Option<&LockRow> {
        self.locks.get(lock_id)
    }

    /// Insert a new lock row with a store-assigned id.
    pub fn insert_lock(&mut self, acquired_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> LockRow {
        let row = LockRow {
            id: uuid::Uuid::new_v4().to_string(),
            acquired_at,
            expires_at,
        };
        self.locks.insert(row.id.clone(), row.clone());
        row
    }

    /// The lock currently holding `record_id`, if any.
    pub fn holder_of(&self, record_id: &str) -> Option<&str> {
        self.locked_records.get(record_id).map(String::as_str)
    }

    pub fn insert_locked_record(&mut self, lock_id: &str, record_id: &str) -> Result<(), StorageError> {
        if !self.locks.contains_key(lock_id) {
            return Err(StorageError::Internal(format!(
                "locked record {} references missing lock {}",
                record_id, lock_id
            )));
        }
        if let Some(holder) = self.locked_records.get(record_id) {
            return Err(StorageError::UniqueViolation {
                record_id: record_id.to_string(),
                holder: holder.clone(),
            });
        }
        self.locked_records
            .insert(record_id.to_string(), lock_id.to_string());
        Ok(())
    }

    pub fn insert_failed_record(&mut self, lock_id: &str, record_id: &str) -> Result<(), StorageError> {
        if !self.locks.contains_key(lock_id) {
            return Err(StorageError::Internal(format!(
                "failed record {} references missing lock {}",
                record_id, lock_id
            )));
        }
        self.failed_records
            .insert((lock_id.to_string(), record_id.to_string()));
        Ok(())
    }

    /// Delete the `(lock_id, record_id)` mapping. Returns the number of rows removed.
    pub fn delete_locked_record(&mut self, lock_id: &str, record_id: &str) -> u64 {
        match self.locked_records.get(record_id) {
            Some(holder) if holder == lock_id => {
                self.locked_records.remove(record_id);
                1
            }
            _ => 0,
        }
    }

    /// Delete a lock and every record row that references it.
    pub fn delete_lock(&mut self, lock_id: &str) -> u64 {
        self.locked_records.retain(|_, holder| holder != lock_id);
        self.failed_records.retain(|(holder, _)| holder != lock_id);
        u64::from(self.locks.remove(lock_id).is_some())
    }

    pub fn set_expiry(&mut self, lock_id: &str, expires_at: DateTime<Utc>) -> u64 {
        match self.locks.get_mut(lock_id) {
            Some(row) => {
                row.expires_at = expires_at;
                1
            }
            None => 0,
        }
    }

    /// Delete every lock with `expires_at <= now`, record rows first.
    /// Returns the ids of the removed locks.
    pub fn delete_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: BTreeSet<String> = self
            .locks
            .values()
            .filter(|row| row.is_expired(now))
            .map(|row| row.id.clone())
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        self.locked_records
            .retain(|_, holder| !expired.contains(holder.as_str()));
        self.failed_records
            .retain(|(holder, _)| !expired.contains(holder.as_str()));
        self.locks.retain(|id, _| !expired.contains(id.as_str()));
        expired.into_iter().collect()
    }

    pub fn count_records(&self, lock_id: &str, kind: RecordKind) -> u64 {
        let count = match kind {
            RecordKind::Locked => self
                .locked_records
                .values()
                .filter(|holder| *holder == lock_id)
                .count(),
            RecordKind::Failed => self
                .failed_records
                .iter()
                .filter(|(holder, _)| holder == lock_id)
                .count(),
        };
        count as u64
    }

    /// One page of a lock's record ids, ordered by record id.
    pub fn scan_records(&self, lock_id: &str, kind: RecordKind, offset: usize, limit: usize) -> Vec<String> {
        match kind {
            RecordKind::Locked => self
                .locked_records
                .iter()
                .filter(|(_, holder)| *holder == lock_id)
                .map(|(record_id, _)| record_id.clone())
                .skip(offset)
                .take(limit)
                .collect(),
            RecordKind::Failed => self
                .failed_records
                .iter()
                .filter(|(holder, _)| holder == lock_id)
                .map(|(_, record_id)| record_id.clone())
                .skip(offset)
                .take(limit)
                .collect(),
        }
    }

    /// One page of lock rows, ordered by id.
    pub fn scan_locks(&self, offset: usize, limit: usize) -> Vec<LockRow> {
        self.locks
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_record_uniqueness() {
        let mut tables = Tables::new();
        let a = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        let b = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));

        tables.insert_locked_record(&a.id, "F1").unwrap();
        match tables.insert_locked_record(&b.id, "F1") {
            Err(StorageError::UniqueViolation { record_id, holder }) => {
                assert_eq!(record_id, "F1");
                assert_eq!(holder, a.id);
            }
            other => panic!("expected unique violation, got {:?}", other),
        }
        assert_eq!(tables.holder_of("F1"), Some(a.id.as_str()));
    }

    #[test]
    fn test_record_rows_need_a_lock() {
        let mut tables = Tables::new();
        assert!(tables.insert_locked_record("missing", "F1").is_err());
        assert!(tables.insert_failed_record("missing", "F1").is_err());
    }

    #[test]
    fn test_delete_record_checks_owner() {
        let mut tables = Tables::new();
        let a = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        let b = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        tables.insert_locked_record(&a.id, "F1").unwrap();

        assert_eq!(tables.delete_locked_record(&b.id, "F1"), 0);
        assert_eq!(tables.holder_of("F1"), Some(a.id.as_str()));
        assert_eq!(tables.delete_locked_record(&a.id, "F1"), 1);
        assert_eq!(tables.delete_locked_record(&a.id, "F1"), 0);
    }

    #[test]
    fn test_delete_lock_cascades() {
        let mut tables = Tables::new();
        let a = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        tables.insert_locked_record(&a.id, "F1").unwrap();
        tables.insert_failed_record(&a.id, "F2").unwrap();

        assert_eq!(tables.delete_lock(&a.id), 1);
        assert_eq!(tables.holder_of("F1"), None);
        assert_eq!(tables.count_records(&a.id, RecordKind::Failed), 0);
        assert_eq!(tables.delete_lock(&a.id), 0);
    }

    #[test]
    fn test_delete_expired_is_inclusive() {
        let mut tables = Tables::new();
        let short = tables.insert_lock(t0(), t0() + TimeDelta::seconds(10));
        let long = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        tables.insert_locked_record(&short.id, "F1").unwrap();
        tables.insert_locked_record(&long.id, "F2").unwrap();

        assert!(tables.delete_expired(t0() + TimeDelta::seconds(9)).is_empty());

        let removed = tables.delete_expired(t0() + TimeDelta::seconds(10));
        assert_eq!(removed, vec![short.id.clone()]);
        assert!(tables.lock(&short.id).is_none());
        assert_eq!(tables.holder_of("F1"), None);
        assert_eq!(tables.holder_of("F2"), Some(long.id.as_str()));
    }

    #[test]
    fn test_scan_pages() {
        let mut tables = Tables::new();
        let a = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        for id in ["F3", "F1", "F2"] {
            tables.insert_locked_record(&a.id, id).unwrap();
        }

        assert_eq!(tables.scan_records(&a.id, RecordKind::Locked, 0, 2), vec!["F1", "F2"]);
        assert_eq!(tables.scan_records(&a.id, RecordKind::Locked, 2, 2), vec!["F3"]);
        assert!(tables.scan_records(&a.id, RecordKind::Locked, 3, 2).is_empty());
    }

    #[test]
    fn test_serde_keeps_all_relations() {
        let mut tables = Tables::new();
        let a = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        tables.insert_locked_record(&a.id, "F1").unwrap();
        tables.insert_failed_record(&a.id, "F2").unwrap();

        let json = serde_json::to_string(&tables).unwrap();
        let back: Tables = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tables);

        let empty: Tables = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.version, 1);
        assert_eq!(empty.lock_count(), 0);
    }

    #[test]
    fn test_default_matches_new() {
        assert_eq!(Tables::default(), Tables::new());
        assert_eq!(Tables::default().version, 1);
    }
}
