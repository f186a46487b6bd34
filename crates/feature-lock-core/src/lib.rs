//! Core traits and types for feature locking.
//!
//! This crate defines the pieces shared by every lock store implementation:
//! - `LockStore`: Transactional access to the `locks`, `locked_records` and
//!   `failed_records` relations
//! - `FeatureStore`: Resolution of a query predicate to concrete record ids
//! - `Clock`: Injectable time source for expiry
//! - `LockManager`: All-or-nothing / best-effort acquisition, release, expiry
//!   sweeping and modifiability checks

mod clock;
mod cursor;
mod error;
mod feature;
mod lock;
mod manager;
mod memory;
mod schema;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cursor::{Cursor, LockCursor, RecordCursor};
pub use error::{LockError, ResolutionError, StorageError};
pub use feature::{FeatureStore, MemoryFeatureStore, Predicate, Query};
pub use lock::{Lock, LockInfo};
pub use manager::{AcquireMode, LockManager, ReleaseAction, DEFAULT_PAGE_SIZE};
pub use memory::MemoryLockStore;
pub use schema::{LockRow, RecordKind, Tables};
pub use store::{
    LockSnapshot, LockStore, LockTransaction, StagedTransaction, TablesSink, TablesSnapshot,
};
