use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use feature_lock_core::{
    LockSnapshot, LockStore, LockTransaction, StagedTransaction, StorageError, Tables,
    TablesSink, TablesSnapshot,
};
use fs2::FileExt;
use tracing::{debug, instrument};

const LOCK_FILE: &str = "locks.lock";
const DATA_FILE: &str = "locks.json";
const TEMP_FILE: &str = "locks.json.tmp";

/// Lock store persisted as a JSON file, shared safely between processes.
///
/// - A transaction opens `locks.lock` and holds an OS exclusive lock on it
///   (flock on Unix, LockFile on Windows) until it commits or is dropped
/// - Commit writes `locks.json.tmp` and renames it over `locks.json`
/// - Snapshots hold a shared lock only while loading `locks.json`
/// - Process crash releases the lock (the OS closes the descriptor)
///
/// Files live directly under `{base_dir}`.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    base_dir: PathBuf,
}

impl FileLockStore {
    /// Create a store rooted at `base_dir`. Nothing is touched until first use.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn open_lock_file(&self) -> Result<File, StorageError> {
        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            StorageError::Io(format!(
                "Failed to create store dir {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.base_dir.join(LOCK_FILE))
            .map_err(|e| StorageError::Io(format!("Failed to open lock file: {}", e)))
    }
}

/// Read `locks.json`; a missing file is an empty store.
fn load_tables(base_dir: &Path) -> Result<Tables, StorageError> {
    let path = base_dir.join(DATA_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tables::new()),
        Err(e) => {
            return Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_str(&content).map_err(|e| {
        StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Atomic write: temp file, synced to disk, then rename.
fn write_tables(base_dir: &Path, tables: &Tables) -> Result<(), StorageError> {
    let content = serde_json::to_string_pretty(tables)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize locks: {}", e)))?;

    let temp_path = base_dir.join(TEMP_FILE);
    let write_err =
        |e: std::io::Error| StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e));
    let mut temp = File::create(&temp_path).map_err(write_err)?;
    temp.write_all(content.as_bytes()).map_err(write_err)?;
    // Data must be durable before the rename publishes it.
    temp.sync_all().map_err(write_err)?;
    drop(temp);

    std::fs::rename(&temp_path, base_dir.join(DATA_FILE))
        .map_err(|e| StorageError::Io(format!("Failed to rename lock data file: {}", e)))?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Internal(format!("Blocking task failed: {}", e)))?
}

/// Holds the exclusive file lock until the staged tables are published or
/// the transaction is dropped.
struct FileSink {
    base_dir: PathBuf,
    file: File,
}

#[async_trait]
impl TablesSink for FileSink {
    async fn publish(self: Box<Self>, tables: Tables) -> Result<(), StorageError> {
        let FileSink { base_dir, file } = *self;
        blocking(move || {
            let result = write_tables(&base_dir, &tables);
            let _ = FileExt::unlock(&file);
            result
        })
        .await
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    fn store_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "trace")]
    async fn begin(&self) -> Result<Box<dyn LockTransaction>, StorageError> {
        let store = self.clone();
        let (file, tables) = blocking(move || {
            let file = store.open_lock_file()?;
            // Waits for any other transaction, in this process or another.
            file.lock_exclusive()
                .map_err(|e| StorageError::Io(format!("Failed to lock store: {}", e)))?;
            let tables = load_tables(&store.base_dir)?;
            Ok((file, tables))
        })
        .await?;

        debug!(
            "Began file transaction in {} ({} locks)",
            self.base_dir.display(),
            tables.lock_count()
        );
        let sink = FileSink {
            base_dir: self.base_dir.clone(),
            file,
        };
        Ok(Box::new(StagedTransaction::new(tables, Box::new(sink))))
    }

    #[instrument(skip(self), level = "trace")]
    async fn snapshot(&self) -> Result<Box<dyn LockSnapshot>, StorageError> {
        let store = self.clone();
        let tables = blocking(move || {
            let file = store.open_lock_file()?;
            file.lock_shared()
                .map_err(|e| StorageError::Io(format!("Failed to lock store: {}", e)))?;
            let tables = load_tables(&store.base_dir);
            let _ = FileExt::unlock(&file);
            tables
        })
        .await?;
        Ok(Box::new(TablesSnapshot::new(tables)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeDelta, Utc};
    use feature_lock_core::{
        AcquireMode, Clock, LockError, LockManager, ManualClock, Query, SystemClock,
    };
    use tempfile::TempDir;

    use super::*;
    use crate::resolver::IdResolver;

    const MINUTE: Duration = Duration::from_secs(60);

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn manager(dir: &Path, clock: Arc<dyn Clock>) -> LockManager {
        LockManager::new(
            Arc::new(FileLockStore::new(dir)),
            Arc::new(IdResolver::new()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_locks_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));

        let lock = manager(temp.path(), clock.clone())
            .acquire_lock(&Query::ids("Road", ["R1", "R2"]), AcquireMode::AllOrNothing, MINUTE)
            .await
            .unwrap();
        assert!(temp.path().join(DATA_FILE).exists());
        assert!(!temp.path().join(TEMP_FILE).exists());

        let reopened = manager(temp.path(), clock.clone());
        assert!(reopened.is_feature_locked("R1").await.unwrap());
        let found = reopened.get_lock(lock.id()).await.unwrap();
        assert_eq!(found.info(), lock.info());

        let ids = found.locked_feature_ids().await.unwrap().collect_all().await.unwrap();
        assert_eq!(ids, vec!["R1", "R2"]);
    }

    #[tokio::test]
    async fn test_rollback_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let store = FileLockStore::new(temp.path());

        let mut txn = store.begin().await.unwrap();
        txn.insert_lock(t0(), t0() + TimeDelta::seconds(60)).await.unwrap();
        txn.commit().await.unwrap();
        let before = std::fs::read_to_string(temp.path().join(DATA_FILE)).unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.insert_lock(t0(), t0() + TimeDelta::seconds(60)).await.unwrap();
        txn.rollback().await.unwrap();

        {
            let mut txn = store.begin().await.unwrap();
            txn.insert_lock(t0(), t0() + TimeDelta::seconds(60)).await.unwrap();
            // dropped without commit
        }

        let after = std::fs::read_to_string(temp.path().join(DATA_FILE)).unwrap();
        assert_eq!(before, after);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.scan_locks(0, 10).await.unwrap().len(), 1);
        snapshot.close().await.unwrap();
    }

    #[test]
    fn test_write_replaces_data_file() {
        let temp = TempDir::new().unwrap();
        let mut tables = Tables::new();
        write_tables(temp.path(), &tables).unwrap();

        let row = tables.insert_lock(t0(), t0() + TimeDelta::seconds(60));
        tables.insert_locked_record(&row.id, "R1").unwrap();
        write_tables(temp.path(), &tables).unwrap();

        assert!(!temp.path().join(TEMP_FILE).exists());
        assert_eq!(load_tables(temp.path()).unwrap(), tables);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(DATA_FILE), "not json").unwrap();

        let store = FileLockStore::new(temp.path());
        assert!(matches!(
            store.begin().await,
            Err(StorageError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_two_stores_share_uniqueness() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let first = manager(temp.path(), clock.clone());
        let second = manager(temp.path(), clock.clone());

        first
            .acquire_lock(&Query::ids("Road", ["R1", "R2"]), AcquireMode::AllOrNothing, MINUTE)
            .await
            .unwrap();

        let err = second
            .acquire_lock(&Query::ids("Road", ["R2", "R3"]), AcquireMode::AllOrNothing, MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Conflict { ref record_id, .. } if record_id == "R2"));

        let partial = second
            .acquire_lock(&Query::ids("Road", ["R2", "R3"]), AcquireMode::BestEffort, MINUTE)
            .await
            .unwrap();
        assert_eq!(partial.num_locked(), 1);
        assert_eq!(partial.num_failed(), 1);

        clock.advance(TimeDelta::seconds(60));
        assert_eq!(first.sweep_expired().await.unwrap(), 2);
        assert_eq!(second.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_grant_once() {
        use tokio::sync::Barrier;

        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();

        const NUM_TASKS: usize = 8;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let mut handles = vec![];

        for _ in 0..NUM_TASKS {
            let barrier = Arc::clone(&barrier);
            // Separate store and manager per task: only the file lock serializes them.
            let manager = manager(&dir, Arc::new(SystemClock));
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                manager
                    .acquire_lock(&Query::ids("Road", ["shared"]), AcquireMode::AllOrNothing, MINUTE)
                    .await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.expect("task panicked") {
                Ok(_) => granted += 1,
                Err(LockError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(granted, 1);
    }
}
