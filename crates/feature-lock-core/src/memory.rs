use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::schema::Tables;
use crate::store::{
    LockSnapshot, LockStore, LockTransaction, StagedTransaction, TablesSink, TablesSnapshot,
};

/// In-process lock store.
///
/// A transaction holds the tables mutex from `begin` until it is committed,
/// rolled back or dropped, so transactions are fully serialized.
#[derive(Debug, Clone)]
pub struct MemoryLockStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::new())),
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySink {
    guard: OwnedMutexGuard<Tables>,
}

#[async_trait]
impl TablesSink for MemorySink {
    async fn publish(self: Box<Self>, tables: Tables) -> Result<(), StorageError> {
        let MemorySink { mut guard } = *self;
        *guard = tables;
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn store_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "trace")]
    async fn begin(&self) -> Result<Box<dyn LockTransaction>, StorageError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = guard.clone();
        debug!("Began memory transaction ({} locks)", staged.lock_count());
        Ok(Box::new(StagedTransaction::new(
            staged,
            Box::new(MemorySink { guard }),
        )))
    }

    async fn snapshot(&self) -> Result<Box<dyn LockSnapshot>, StorageError> {
        let tables = self.tables.lock().await.clone();
        Ok(Box::new(TablesSnapshot::new(tables)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let store = MemoryLockStore::new();
        let mut txn = store.begin().await.unwrap();
        let row = txn
            .insert_lock(t0(), t0() + TimeDelta::seconds(60))
            .await
            .unwrap();
        txn.insert_locked_record(&row.id, "F1").await.unwrap();
        txn.commit().await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.find_lock(&row.id).await.unwrap(), Some(row.clone()));
        assert_eq!(snapshot.holder_of("F1").await.unwrap(), Some(row.id));
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard() {
        let store = MemoryLockStore::new();

        let mut txn = store.begin().await.unwrap();
        let rolled_back = txn
            .insert_lock(t0(), t0() + TimeDelta::seconds(60))
            .await
            .unwrap();
        txn.rollback().await.unwrap();

        {
            let mut txn = store.begin().await.unwrap();
            txn.insert_lock(t0(), t0() + TimeDelta::seconds(60))
                .await
                .unwrap();
            // dropped without commit
        }

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.find_lock(&rolled_back.id).await.unwrap(), None);
        assert!(snapshot.scan_locks(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_commits() {
        let store = MemoryLockStore::new();
        let before = store.snapshot().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.insert_lock(t0(), t0() + TimeDelta::seconds(60))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(before.scan_locks(0, 10).await.unwrap().is_empty());
        before.close().await.unwrap();
        assert_eq!(store.snapshot().await.unwrap().scan_locks(0, 10).await.unwrap().len(), 1);
    }
}
