use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{LockRow, RecordKind, Tables};

/// Transactional persistence for the lock relations.
///
/// Every mutation a `LockManager` call makes goes through one
/// `LockTransaction`, committed or rolled back as a unit. Reads that outlive
/// a single call (cursors) go through a `LockSnapshot`.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Returns the store identifier (e.g., "memory", "file").
    fn store_name(&self) -> &'static str;

    /// Begin a read-write transaction.
    async fn begin(&self) -> Result<Box<dyn LockTransaction>, StorageError>;

    /// Open a consistent read-only view of the relations.
    async fn snapshot(&self) -> Result<Box<dyn LockSnapshot>, StorageError>;
}

/// A read-write transaction over the lock relations.
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait LockTransaction: Send {
    /// Insert a `locks` row; the store assigns the id.
    async fn insert_lock(
        &mut self,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LockRow, StorageError>;

    async fn find_lock(&mut self, lock_id: &str) -> Result<Option<LockRow>, StorageError>;

    /// The id of the lock holding `record_id`, if any.
    async fn holder_of(&mut self, record_id: &str) -> Result<Option<String>, StorageError>;

    /// Insert into `locked_records`.
    ///
    /// Fails with `StorageError::UniqueViolation` when the record is already
    /// mapped to a lock.
    async fn insert_locked_record(
        &mut self,
        lock_id: &str,
        record_id: &str,
    ) -> Result<(), StorageError>;

    async fn insert_failed_record(
        &mut self,
        lock_id: &str,
        record_id: &str,
    ) -> Result<(), StorageError>;

    /// Delete `(lock_id, record_id)` from `locked_records`; rows held by
    /// another lock are left alone. Returns the number of rows removed.
    async fn delete_locked_record(
        &mut self,
        lock_id: &str,
        record_id: &str,
    ) -> Result<u64, StorageError>;

    /// Delete a lock together with its locked and failed record rows.
    async fn delete_lock(&mut self, lock_id: &str) -> Result<u64, StorageError>;

    async fn set_expiry(
        &mut self,
        lock_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Delete every lock with `expires_at <= now` and its record rows.
    async fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError>;

    async fn count_records(&mut self, lock_id: &str, kind: RecordKind) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// A read-only, point-in-time view of the lock relations.
#[async_trait]
pub trait LockSnapshot: Send + Sync {
    async fn find_lock(&self, lock_id: &str) -> Result<Option<LockRow>, StorageError>;

    async fn holder_of(&self, record_id: &str) -> Result<Option<String>, StorageError>;

    async fn count_records(&self, lock_id: &str, kind: RecordKind) -> Result<u64, StorageError>;

    async fn scan_records(
        &self,
        lock_id: &str,
        kind: RecordKind,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;

    async fn scan_locks(&self, offset: usize, limit: usize) -> Result<Vec<LockRow>, StorageError>;

    /// Release whatever the snapshot holds open.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Where a `StagedTransaction` publishes its tables on commit.
#[async_trait]
pub trait TablesSink: Send {
    async fn publish(self: Box<Self>, tables: Tables) -> Result<(), StorageError>;
}

/// A transaction that stages a private copy of `Tables`.
///
/// The sink owns whatever guard makes the transaction exclusive (an async
/// mutex guard, an OS file lock) and releases it when it is consumed or
/// dropped, so rollback is simply not publishing.
pub struct StagedTransaction {
    tables: Tables,
    sink: Box<dyn TablesSink>,
}

impl StagedTransaction {
    pub fn new(tables: Tables, sink: Box<dyn TablesSink>) -> Self {
        Self { tables, sink }
    }
}

#[async_trait]
impl LockTransaction for StagedTransaction {
    async fn insert_lock(
        &mut self,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LockRow, StorageError> {
        Ok(self.tables.insert_lock(acquired_at, expires_at))
    }

    async fn find_lock(&mut self, lock_id: &str) -> Result<Option<LockRow>, StorageError> {
        Ok(self.tables.lock(lock_id).cloned())
    }

    async fn holder_of(&mut self, record_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.tables.holder_of(record_id).map(str::to_string))
    }

    async fn insert_locked_record(
        &mut self,
        lock_id: &str,
        record_id: &str,
    ) -> Result<(), StorageError> {
        self.tables.insert_locked_record(lock_id, record_id)
    }

    async fn insert_failed_record(
        &mut self,
        lock_id: &str,
        record_id: &str,
    ) -> Result<(), StorageError> {
        self.tables.insert_failed_record(lock_id, record_id)
    }

    async fn delete_locked_record(
        &mut self,
        lock_id: &str,
        record_id: &str,
    ) -> Result<u64, StorageError> {
        Ok(self.tables.delete_locked_record(lock_id, record_id))
    }

    async fn delete_lock(&mut self, lock_id: &str) -> Result<u64, StorageError> {
        Ok(self.tables.delete_lock(lock_id))
    }

    async fn set_expiry(
        &mut self,
        lock_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        Ok(self.tables.set_expiry(lock_id, expires_at))
    }

    async fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        Ok(self.tables.delete_expired(now))
    }

    async fn count_records(&mut self, lock_id: &str, kind: RecordKind) -> Result<u64, StorageError> {
        Ok(self.tables.count_records(lock_id, kind))
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let StagedTransaction { tables, sink } = *self;
        sink.publish(tables).await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A snapshot over an owned copy of `Tables`.
#[derive(Debug)]
pub struct TablesSnapshot {
    tables: Tables,
}

impl TablesSnapshot {
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl LockSnapshot for TablesSnapshot {
    async fn find_lock(&self, lock_id: &str) -> Result<Option<LockRow>, StorageError> {
        Ok(self.tables.lock(lock_id).cloned())
    }

    async fn holder_of(&self, record_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.tables.holder_of(record_id).map(str::to_string))
    }

    async fn count_records(&self, lock_id: &str, kind: RecordKind) -> Result<u64, StorageError> {
        Ok(self.tables.count_records(lock_id, kind))
    }

    async fn scan_records(
        &self,
        lock_id: &str,
        kind: RecordKind,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self.tables.scan_records(lock_id, kind, offset, limit))
    }

    async fn scan_locks(&self, offset: usize, limit: usize) -> Result<Vec<LockRow>, StorageError> {
        Ok(self.tables.scan_locks(offset, limit))
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
