use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::cursor::{Cursor, LockCursor, LockScan};
use crate::error::{LockError, StorageError};
use crate::feature::{FeatureStore, Query};
use crate::lock::{Lock, LockInfo};
use crate::schema::{LockRow, RecordKind};
use crate::store::{LockSnapshot, LockStore, LockTransaction};


/// Default number of rows a cursor fetches per page.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// What to do when some matching records are already locked elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Any conflict aborts the request; nothing is persisted.
    AllOrNothing,
    /// Conflicting records are reported as failed; the rest are locked.
    BestEffort,
}

/// How a lock is treated once the edits made under it are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    /// Release the whole lock.
    All,
    /// Release only the touched records and restart the expiry of the rest.
    Some,
}

/// Grants, tracks, expires and releases feature locks.
///
/// Every operation runs inside one manager-wide critical section and starts
/// by sweeping expired locks, so "sweep, then evaluate" is atomic for all
/// callers of this instance. Several managers (or processes) sharing one
/// store stay consistent through the store's record uniqueness constraint.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    features: Arc<dyn FeatureStore>,
    clock: Arc<dyn Clock>,
    page_size: usize,
    gate: Mutex<()>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.store.store_name())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(
        store: Arc<dyn LockStore>,
        features: Arc<dyn FeatureStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            features,
            clock,
            page_size: DEFAULT_PAGE_SIZE,
            gate: Mutex::new(()),
        }
    }

    /// Set how many rows cursors fetch per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Lock every record matched by `query`.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_lock(
        &self,
        query: &Query,
        mode: AcquireMode,
        ttl: Duration,
    ) -> Result<Lock, LockError> {
        self.acquire_lock_for(std::slice::from_ref(query), mode, ttl)
            .await
    }

    /// Lock the union of the records matched by `queries`.
    ///
    /// Records are visited in query order, then resolution order; duplicates
    /// are visited once. With `AllOrNothing` the first conflict rolls the
    /// whole grant back and is reported as `LockError::Conflict`.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_lock_for(
        &self,
        queries: &[Query],
        mode: AcquireMode,
        ttl: Duration,
    ) -> Result<Lock, LockError> {
        let ttl = expiry_delta(ttl)?;
        let _gate = self.gate.lock().await;
        let now = self.clock.now();
        self.sweep(now).await?;

        let record_ids = self.resolve_all(queries).await?;
        let expires_at = offset(now, ttl)?;

        let mut txn = self.store.begin().await?;
        let result = Self::grant(txn.as_mut(), &record_ids, mode, now, expires_at).await;
        let info = finish(txn, result).await?;

        info!(
            "Granted lock {} on {} records ({} failed, expires at {})",
            info.id, info.num_locked, info.num_failed, info.expires_at
        );
        Ok(self.handle(info))
    }

    async fn grant(
        txn: &mut dyn LockTransaction,
        record_ids: &[String],
        mode: AcquireMode,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LockInfo, LockError> {
        let row = txn.insert_lock(now, expires_at).await?;
        let mut num_locked = 0;
        let mut num_failed = 0;

        for record_id in record_ids {
            let holder = match txn.insert_locked_record(&row.id, record_id).await {
                Ok(()) => {
                    num_locked += 1;
                    continue;
                }
                Err(StorageError::UniqueViolation { holder, .. }) => holder,
                Err(e) => return Err(e.into()),
            };

            let holder_row = txn.find_lock(&holder).await?.ok_or_else(|| {
                StorageError::Internal(format!(
                    "record {} is mapped to missing lock {}",
                    record_id, holder
                ))
            })?;

            // Another writer on the same store may have left an expired
            // holder behind since our sweep.
            if holder_row.is_expired(now) {
                debug!(
                    "Reaping expired lock {} that still held {}",
                    holder_row.id, record_id
                );
                txn.delete_lock(&holder_row.id).await?;
                txn.insert_locked_record(&row.id, record_id).await?;
                num_locked += 1;
                continue;
            }

            match mode {
                AcquireMode::AllOrNothing => {
                    debug!(
                        "Record {} held by {} until {}, aborting grant",
                        record_id, holder_row.id, holder_row.expires_at
                    );
                    return Err(LockError::Conflict {
                        record_id: record_id.clone(),
                        held_until: holder_row.expires_at,
                    });
                }
                AcquireMode::BestEffort => {
                    txn.insert_failed_record(&row.id, record_id).await?;
                    num_failed += 1;
                }
            }
        }

        Ok(LockInfo::from_row(row, num_locked, num_failed))
    }

    async fn resolve_all(&self, queries: &[Query]) -> Result<Vec<String>, LockError> {
        let mut seen = HashSet::new();
        let mut record_ids = Vec::new();
        for query in queries {
            for record_id in self.features.resolve(query).await? {
                if seen.insert(record_id.clone()) {
                    record_ids.push(record_id);
                }
            }
        }
        Ok(record_ids)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Release a whole lock. Unknown, released or expired ids are a no-op.
    #[instrument(skip(self), level = "debug")]
    pub async fn release(&self, lock_id: &str) -> Result<(), LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;

        let mut txn = self.store.begin().await?;
        let result = txn.delete_lock(lock_id).await.map_err(LockError::from);
        let removed = finish(txn, result).await?;

        if removed == 0 {
            debug!("Lock {} already released or expired", lock_id);
        } else {
            info!("Released lock {}", lock_id);
        }
        Ok(())
    }

    /// Release one record from `lock_id`.
    ///
    /// A record held by a different lock is left alone.
    #[instrument(skip(self), level = "debug")]
    pub async fn release_record(&self, lock_id: &str, record_id: &str) -> Result<(), LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;

        let mut txn = self.store.begin().await?;
        let result = Self::release_owned(txn.as_mut(), lock_id, record_id).await;
        let released = finish(txn, result).await?;

        if released {
            debug!("Released {} from lock {}", record_id, lock_id);
        }
        Ok(())
    }

    async fn release_owned(
        txn: &mut dyn LockTransaction,
        lock_id: &str,
        record_id: &str,
    ) -> Result<bool, LockError> {
        match txn.holder_of(record_id).await? {
            Some(holder) if holder == lock_id => {
                Ok(txn.delete_locked_record(lock_id, record_id).await? == 1)
            }
            Some(holder) => {
                debug!(
                    "Cannot release {}: held by {} not {}",
                    record_id, holder, lock_id
                );
                Ok(false)
            }
            None => {
                debug!("Record {} not locked by {}", record_id, lock_id);
                Ok(false)
            }
        }
    }

    /// Release every record matched by `query`, whichever lock holds it.
    #[instrument(skip(self), level = "debug")]
    pub async fn release_matching(&self, query: &Query) -> Result<(), LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;
        let record_ids = self.resolve_all(std::slice::from_ref(query)).await?;

        let mut txn = self.store.begin().await?;
        let result = Self::release_any(txn.as_mut(), &record_ids).await;
        let absent = finish(txn, result).await?;

        if !absent.is_empty() {
            debug!(
                "{} of {} matched records were not locked: {:?}",
                absent.len(),
                record_ids.len(),
                absent
            );
        }
        Ok(())
    }

    async fn release_any(
        txn: &mut dyn LockTransaction,
        record_ids: &[String],
    ) -> Result<Vec<String>, LockError> {
        let mut absent = Vec::new();
        for record_id in record_ids {
            let removed = match txn.holder_of(record_id).await? {
                Some(holder) => txn.delete_locked_record(&holder, record_id).await?,
                None => 0,
            };
            if removed == 0 {
                absent.push(record_id.clone());
            }
        }
        Ok(absent)
    }

    /// Settle a lock after the edits made under it.
    ///
    /// `All`, or a lock with nothing left locked, releases the whole lock.
    /// `Some` releases `touched` and restarts the expiry of the remaining
    /// records with the lock's original duration. Returns the surviving
    /// lock, if any.
    #[instrument(skip(self), level = "debug")]
    pub async fn complete_transaction(
        &self,
        lock_id: &str,
        action: ReleaseAction,
        touched: &[String],
    ) -> Result<Option<Lock>, LockError> {
        let _gate = self.gate.lock().await;
        let now = self.clock.now();
        self.sweep(now).await?;

        let mut txn = self.store.begin().await?;
        let result = Self::settle(txn.as_mut(), lock_id, action, touched, now).await;
        let survivor = finish(txn, result).await?;

        match &survivor {
            Some(info) => debug!(
                "Lock {} keeps {} records until {}",
                info.id, info.num_locked, info.expires_at
            ),
            None => debug!("Lock {} settled and released", lock_id),
        }
        Ok(survivor.map(|info| self.handle(info)))
    }

    async fn settle(
        txn: &mut dyn LockTransaction,
        lock_id: &str,
        action: ReleaseAction,
        touched: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<LockInfo>, LockError> {
        let Some(row) = txn.find_lock(lock_id).await? else {
            return Ok(None);
        };

        if action == ReleaseAction::Some {
            for record_id in touched {
                Self::release_owned(txn, lock_id, record_id).await?;
            }
        }

        let num_locked = txn.count_records(lock_id, RecordKind::Locked).await?;
        if action == ReleaseAction::All || num_locked == 0 {
            txn.delete_lock(lock_id).await?;
            return Ok(None);
        }

        let expires_at = offset(now, row.expires_at - row.acquired_at)?;
        txn.set_expiry(lock_id, expires_at).await?;
        let num_failed = txn.count_records(lock_id, RecordKind::Failed).await?;
        let row = LockRow { expires_at, ..row };
        Ok(Some(LockInfo::from_row(row, num_locked, num_failed)))
    }

    /// Restart a live lock's expiry at `now + ttl`.
    #[instrument(skip(self), level = "debug")]
    pub async fn renew(&self, lock_id: &str, ttl: Duration) -> Result<Lock, LockError> {
        let ttl = expiry_delta(ttl)?;
        let _gate = self.gate.lock().await;
        let now = self.clock.now();
        self.sweep(now).await?;
        let expires_at = offset(now, ttl)?;

        let mut txn = self.store.begin().await?;
        let result = Self::extend(txn.as_mut(), lock_id, expires_at).await;
        let info = finish(txn, result).await?;

        debug!("Renewed lock {} until {}", info.id, info.expires_at);
        Ok(self.handle(info))
    }

    async fn extend(
        txn: &mut dyn LockTransaction,
        lock_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockInfo, LockError> {
        if txn.set_expiry(lock_id, expires_at).await? == 0 {
            return Err(LockError::NotFound(lock_id.to_string()));
        }
        let row = txn
            .find_lock(lock_id)
            .await?
            .ok_or_else(|| LockError::NotFound(lock_id.to_string()))?;
        let num_locked = txn.count_records(lock_id, RecordKind::Locked).await?;
        let num_failed = txn.count_records(lock_id, RecordKind::Failed).await?;
        Ok(LockInfo::from_row(row, num_locked, num_failed))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Look up a live lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_lock(&self, lock_id: &str) -> Result<Lock, LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;

        let snapshot = self.store.snapshot().await?;
        let result = load_info(snapshot.as_ref(), lock_id).await;
        snapshot.close().await?;

        match result? {
            Some(info) => Ok(self.handle(info)),
            None => Err(LockError::NotFound(lock_id.to_string())),
        }
    }

    /// Whether any live lock holds `record_id`.
    #[instrument(skip(self), level = "debug")]
    pub async fn is_feature_locked(&self, record_id: &str) -> Result<bool, LockError> {
        Ok(self.live_holder(record_id).await?.is_some())
    }

    /// Whether `record_id` may be modified by the holder of `lock_id`:
    /// true if it is unlocked, or locked by exactly that lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn is_feature_modifiable(
        &self,
        record_id: &str,
        lock_id: Option<&str>,
    ) -> Result<bool, LockError> {
        Ok(match self.live_holder(record_id).await? {
            None => true,
            Some(holder) => lock_id == Some(holder.as_str()),
        })
    }

    /// Fail unless every record is modifiable by `lock_id`.
    ///
    /// Distinguishes a missing lock id from a wrong one, which callers
    /// report differently.
    #[instrument(skip(self), level = "debug")]
    pub async fn ensure_modifiable(
        &self,
        record_ids: &[String],
        lock_id: Option<&str>,
    ) -> Result<(), LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;

        let snapshot = self.store.snapshot().await?;
        let result = check_modifiable(snapshot.as_ref(), record_ids, lock_id).await;
        snapshot.close().await?;
        result
    }

    /// Every live lock.
    ///
    /// The sweep runs once, before the cursor is produced.
    #[instrument(skip(self), level = "debug")]
    pub async fn active_locks(&self) -> Result<LockCursor, LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;

        let snapshot = self.store.snapshot().await?;
        let scan = LockScan {
            store: Arc::clone(&self.store),
            page_size: self.page_size,
        };
        Ok(Cursor::new(snapshot, Box::new(scan), self.page_size))
    }

    /// Run the expiry sweep now. Returns the number of locks removed.
    #[instrument(skip(self), level = "debug")]
    pub async fn sweep_expired(&self) -> Result<usize, LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn live_holder(&self, record_id: &str) -> Result<Option<String>, LockError> {
        let _gate = self.gate.lock().await;
        self.sweep(self.clock.now()).await?;

        let snapshot = self.store.snapshot().await?;
        let holder = snapshot.holder_of(record_id).await;
        snapshot.close().await?;
        Ok(holder?)
    }

    /// Delete every lock with `expires_at <= now`. Must be called inside the gate.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, LockError> {
        let mut txn = self.store.begin().await?;
        let expired = match txn.delete_expired(now).await {
            Ok(expired) => expired,
            Err(e) => return finish(txn, Err(e.into())).await,
        };

        if expired.is_empty() {
            txn.rollback().await?;
            return Ok(0);
        }

        txn.commit().await?;
        debug!("Swept {} expired locks: {:?}", expired.len(), expired);
        Ok(expired.len())
    }

    fn handle(&self, info: LockInfo) -> Lock {
        Lock::new(info, Arc::clone(&self.store), self.page_size)
    }
}

/// Commit on success, roll back on failure. A failed rollback is logged and
/// the original error returned.
async fn finish<R>(
    txn: Box<dyn LockTransaction>,
    result: Result<R, LockError>,
) -> Result<R, LockError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                warn!("Rollback failed after {}: {}", e, rollback);
            }
            Err(e)
        }
    }
}

async fn load_info(
    snapshot: &dyn LockSnapshot,
    lock_id: &str,
) -> Result<Option<LockInfo>, StorageError> {
    let Some(row) = snapshot.find_lock(lock_id).await? else {
        return Ok(None);
    };
    let num_locked = snapshot.count_records(lock_id, RecordKind::Locked).await?;
    let num_failed = snapshot.count_records(lock_id, RecordKind::Failed).await?;
    Ok(Some(LockInfo::from_row(row, num_locked, num_failed)))
}

async fn check_modifiable(
    snapshot: &dyn LockSnapshot,
    record_ids: &[String],
    lock_id: Option<&str>,
) -> Result<(), LockError> {
    for record_id in record_ids {
        let Some(holder) = snapshot.holder_of(record_id).await? else {
            continue;
        };
        match lock_id {
            None => {
                return Err(LockError::MissingLockId {
                    record_id: record_id.clone(),
                })
            }
            Some(lock_id) if lock_id != holder => {
                return Err(LockError::WrongLockId {
                    record_id: record_id.clone(),
                    lock_id: lock_id.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn expiry_delta(ttl: Duration) -> Result<TimeDelta, LockError> {
    if ttl.is_zero() {
        return Err(LockError::InvalidArgument(
            "lock expiry must be positive".to_string(),
        ));
    }
    TimeDelta::from_std(ttl)
        .map_err(|e| LockError::InvalidArgument(format!("lock expiry out of range: {}", e)))
}

fn offset(now: DateTime<Utc>, ttl: TimeDelta) -> Result<DateTime<Utc>, LockError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| LockError::InvalidArgument(format!("expiry overflows at {}", now)))
}
