use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{Cursor, RecordCursor, RecordScan};
use crate::error::StorageError;
use crate::schema::{LockRow, RecordKind};
use crate::store::LockStore;

/// Point-in-time description of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Records held by this lock
    pub num_locked: u64,
    /// Records that matched at acquisition but were held by another lock
    pub num_failed: u64,
}

impl LockInfo {
    pub(crate) fn from_row(row: LockRow, num_locked: u64, num_failed: u64) -> Self {
        Self {
            id: row.id,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            num_locked,
            num_failed,
        }
    }
}

/// Handle to a lock granted by a `LockManager`.
///
/// The scalar fields are a snapshot taken when the handle was produced and
/// go stale as soon as time passes or another call touches the lock. The
/// record enumerations and `is_locked` read the store afresh.
///
/// Handle reads do not sweep. Once the lock has expired they keep reporting
/// its records until some `LockManager` call sweeps it away; use
/// `is_expired_at` or the manager's queries when expiry matters.
#[derive(Clone)]
pub struct Lock {
    info: LockInfo,
    store: Arc<dyn LockStore>,
    page_size: usize,
}

impl Lock {
    pub(crate) fn new(info: LockInfo, store: Arc<dyn LockStore>, page_size: usize) -> Self {
        Self {
            info,
            store,
            page_size,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.info.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.info.expires_at
    }

    pub fn num_locked(&self) -> u64 {
        self.info.num_locked
    }

    pub fn num_failed(&self) -> u64 {
        self.info.num_failed
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Whether the snapshot had already run out at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.info.expires_at <= now
    }

    /// Ids of the records this lock holds.
    pub async fn locked_feature_ids(&self) -> Result<RecordCursor, StorageError> {
        self.records(RecordKind::Locked).await
    }

    /// Ids of the records that could not be locked at acquisition.
    pub async fn failed_feature_ids(&self) -> Result<RecordCursor, StorageError> {
        self.records(RecordKind::Failed).await
    }

    /// Whether `record_id` is held by this lock specifically.
    pub async fn is_locked(&self, record_id: &str) -> Result<bool, StorageError> {
        let snapshot = self.store.snapshot().await?;
        let holder = snapshot.holder_of(record_id).await;
        snapshot.close().await?;
        Ok(holder?.as_deref() == Some(self.id()))
    }

    async fn records(&self, kind: RecordKind) -> Result<RecordCursor, StorageError> {
        let snapshot = self.store.snapshot().await?;
        let scan = RecordScan {
            lock_id: self.info.id.clone(),
            kind,
        };
        Ok(Cursor::new(snapshot, Box::new(scan), self.page_size))
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("info", &self.info)
            .field("store", &self.store.store_name())
            .finish_non_exhaustive()
    }
}
