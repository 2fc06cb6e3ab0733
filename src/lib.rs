//! # baselock - Multi-Granularity Lock Manager
//!
//! baselock coordinates concurrent sessions of a multi-user object database.
//! Records live in named partitions ("bases"); sessions lock whole
//! partitions before reading, exporting or changing them, and reserve
//! individual records against deletion while they hold references to them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use baselock::LockManager;
//!
//! let manager = LockManager::builder()
//!     .partitions(["users", "groups", "systems"])
//!     .build()?;
//!
//! let session = manager.open_session();
//! let users = manager.partition("users").unwrap();
//! let lock = session.open_write_lock(&[users])?;
//! // ... edit records in "users" ...
//! session.release_lock(&lock)?;
//! manager.end_session(&session)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          LockManager (coordinator)        │
//! ├─────────────────────┬────────────────────┤
//! │  SessionLockManager │  DeletionManager    │
//! │  (per session)      │  (record reserves)  │
//! ├─────────────────────┴────────────────────┤
//! │   Lock: ReadLock │ WriteLock │ DumpLock   │
//! ├──────────────────────────────────────────┤
//! │  LockSync monitor: partition queues,      │
//! │  owner-key table, counters, ops gate      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - A writer never shares a partition with another writer, a reader or a
//!   dumper. Readers and dumpers share freely.
//! - A lock is active on all of its partitions or on none of them.
//! - An owner key holding a write or dump lock cannot request anything
//!   else; such requests fail immediately instead of deadlocking.
//! - Dumps take priority over writers that have not yet started queuing.
//!
//! ## Module Overview
//!
//! - [`lock`]: lock handles, the three lock kinds and the shared monitor
//! - [`session`]: per-session bookkeeping and self-conflict pre-checks
//! - [`deletion`]: deletion locks, checkpoints and rollback
//! - [`partition`]: partition identity and registry
//! - [`manager`]: the coordinator and its builder
//! - [`config`]: tunable constants
//! - [`error`]: the `LockError` taxonomy

pub mod config;
pub mod deletion;
pub mod error;
pub mod lock;
pub mod manager;
pub mod partition;
pub mod session;

pub use deletion::{DeletionCheckpoint, DeletionManager, DeletionTarget, Invid};
pub use error::{lock_error, LockError};
pub use lock::{
    Lock, LockId, LockKind, LockState, LockStatsSnapshot, LockSync, OwnerKey, PartitionSnapshot,
};
pub use manager::{LockManager, LockManagerBuilder};
pub use partition::{Partition, PartitionId, PartitionRegistry};
pub use session::SessionLockManager;
