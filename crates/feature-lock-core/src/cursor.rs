use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tracing::warn;

use crate::error::StorageError;
use crate::lock::{Lock, LockInfo};
use crate::schema::RecordKind;
use crate::store::{LockSnapshot, LockStore};

/// Fetches one page of items from a snapshot.
#[async_trait]
pub(crate) trait Scan<T>: Send + Sync {
    async fn page(
        &self,
        snapshot: &dyn LockSnapshot,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<T>, StorageError>;
}

/// Record ids of one lock.
pub(crate) struct RecordScan {
    pub(crate) lock_id: String,
    pub(crate) kind: RecordKind,
}

#[async_trait]
impl Scan<String> for RecordScan {
    async fn page(
        &self,
        snapshot: &dyn LockSnapshot,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        snapshot
            .scan_records(&self.lock_id, self.kind, offset, limit)
            .await
    }
}

/// Every lock, as handles bound to `store`.
pub(crate) struct LockScan {
    pub(crate) store: Arc<dyn LockStore>,
    pub(crate) page_size: usize,
}

#[async_trait]
impl Scan<Lock> for LockScan {
    async fn page(
        &self,
        snapshot: &dyn LockSnapshot,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Lock>, StorageError> {
        let rows = snapshot.scan_locks(offset, limit).await?;
        let mut locks = Vec::with_capacity(rows.len());
        for row in rows {
            let num_locked = snapshot.count_records(&row.id, RecordKind::Locked).await?;
            let num_failed = snapshot.count_records(&row.id, RecordKind::Failed).await?;
            let info = LockInfo::from_row(row, num_locked, num_failed);
            locks.push(Lock::new(info, Arc::clone(&self.store), self.page_size));
        }
        Ok(locks)
    }
}

/// A finite, single-pass sequence read page by page from a store snapshot.
///
/// The snapshot is held until the cursor is exhausted, closed, or dropped.
/// Callers that stop early should `close` the cursor; dropping it releases
/// the snapshot as well, without reporting close errors.
pub struct Cursor<T> {
    snapshot: Option<Box<dyn LockSnapshot>>,
    scan: Box<dyn Scan<T>>,
    page_size: usize,
    offset: usize,
    buffered: VecDeque<T>,
}

/// Record ids of one lock (locked or failed).
pub type RecordCursor = Cursor<String>;

/// Active locks.
pub type LockCursor = Cursor<Lock>;

impl<T: Send + 'static> Cursor<T> {
    pub(crate) fn new(
        snapshot: Box<dyn LockSnapshot>,
        scan: Box<dyn Scan<T>>,
        page_size: usize,
    ) -> Self {
        Self {
            snapshot: Some(snapshot),
            scan,
            page_size: page_size.max(1),
            offset: 0,
            buffered: VecDeque::new(),
        }
    }

    /// Whether the cursor has released its snapshot.
    pub fn is_closed(&self) -> bool {
        self.snapshot.is_none()
    }

    /// Next item, or `None` once the sequence is exhausted.
    ///
    /// The snapshot is released as soon as the last page comes back short.
    pub async fn next(&mut self) -> Result<Option<T>, StorageError> {
        if let Some(item) = self.buffered.pop_front() {
            return Ok(Some(item));
        }
        let Some(snapshot) = self.snapshot.as_deref() else {
            return Ok(None);
        };

        let result = self.scan.page(snapshot, self.offset, self.page_size).await;
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.release().await;
                return Err(e);
            }
        };
        self.offset += page.len();
        let exhausted = page.len() < self.page_size;
        self.buffered.extend(page);
        if exhausted {
            self.release().await;
        }
        Ok(self.buffered.pop_front())
    }

    /// Release the snapshot. Items not yet read are discarded.
    pub async fn close(mut self) -> Result<(), StorageError> {
        self.buffered.clear();
        match self.snapshot.take() {
            Some(snapshot) => snapshot.close().await,
            None => Ok(()),
        }
    }

    /// Drain the remaining items and close.
    pub async fn collect_all(mut self) -> Result<Vec<T>, StorageError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        self.close().await?;
        Ok(items)
    }

    /// Adapt the cursor into a `Stream`. The snapshot is released when the
    /// stream ends, fails, or is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, StorageError>> + Send {
        stream::try_unfold(self, |mut cursor| async move {
            match cursor.next().await? {
                Some(item) => Ok::<_, StorageError>(Some((item, cursor))),
                None => {
                    cursor.close().await?;
                    Ok(None)
                }
            }
        })
    }

    async fn release(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Err(e) = snapshot.close().await {
                warn!("Failed to close lock store snapshot: {}", e);
            }
        }
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("offset", &self.offset)
            .field("page_size", &self.page_size)
            .field("buffered", &self.buffered.len())
            .field("open", &self.snapshot.is_some())
            .finish()
    }
}
