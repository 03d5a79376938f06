//! File-backed persistence primitives.
//!
//! This module provides:
//! - `RecordStore`: a JSON object on disk mapping string keys to values
//! - `ExpiringRecordStore`: a `RecordStore` whose entries expire after a TTL
//! - `RuntimeLock`: cross-process mutual exclusion through lock marker files
//!
//! Stores never fail on a missing or unreadable file. They read it as empty
//! and the next successful write replaces it.

mod file;
pub mod expiring;
pub mod lock;
pub mod record;

pub use expiring::ExpiringRecordStore;
pub use lock::{LockGuard, LockMarker, RuntimeLock};
pub use record::{ReadOutcome, RecordStore};
