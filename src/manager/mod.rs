//! # Lock Manager
//!
//! `LockManager` is the one coordinator object a server creates at startup
//! and hands to every session. It owns the pieces that must be shared:
//!
//! ```text
//! LockManager (Clone, Arc-backed)
//!   ├── sync:      Arc<LockSync>          one monitor for all partitions and kinds
//!   ├── registry:  Arc<PartitionRegistry> name-ordered partition catalog
//!   ├── deletion:  DeletionManager        record-level deletion protections
//!   └── next_key:  AtomicU64              owner keys for new sessions
//! ```
//!
//! ## Session Lifecycle
//!
//! ```text
//! open_session() ──> SessionLockManager ──> open_*_lock / release_lock
//!                                        │
//! end_session()  <───────────────────────┘   aborts every lock, then drops
//!                                            the session's deletion locks
//! ```
//!
//! ## Server Lifecycle
//!
//! | Call                     | Operations status      | Blocked write establishes |
//! |--------------------------|------------------------|---------------------------|
//! | `enable_operations()`    | enabled                | keep waiting              |
//! | `begin_shutdown()`       | `"shutdown"`           | keep waiting              |
//! | `disable_operations(m)`  | `m`                    | fail with `m`             |

mod builder;

pub use builder::LockManagerBuilder;

use crate::config::SHUTDOWN_NOTICE;
use crate::deletion::DeletionManager;
use crate::lock::{LockStatsSnapshot, LockSync, OwnerKey};
use crate::partition::{Partition, PartitionRegistry};
use crate::session::SessionLockManager;
use eyre::Result;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Shared {
    sync: Arc<LockSync>,
    registry: Arc<PartitionRegistry>,
    deletion: DeletionManager,
    next_key: AtomicU64,
}

#[derive(Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_interval(crate::config::DEFAULT_RECHECK_INTERVAL)
    }

    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::new()
    }

    pub(crate) fn with_interval(recheck_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sync: Arc::new(LockSync::new(recheck_interval)),
                registry: Arc::new(PartitionRegistry::new()),
                deletion: DeletionManager::new(),
                next_key: AtomicU64::new(1),
            }),
        }
    }

    pub fn sync(&self) -> &Arc<LockSync> {
        &self.shared.sync
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.shared.registry
    }

    pub fn deletion(&self) -> &DeletionManager {
        &self.shared.deletion
    }

    pub fn register_partition(&self, name: &str) -> Partition {
        self.shared.registry.register(name)
    }

    pub fn partition(&self, name: &str) -> Option<Partition> {
        self.shared.registry.get(name)
    }

    /// Every registered partition, in name order.
    pub fn partitions(&self) -> Vec<Partition> {
        self.shared.registry.all()
    }

    /// Opens a session under a fresh owner key.
    pub fn open_session(&self) -> SessionLockManager {
        let key = OwnerKey(self.shared.next_key.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%key, "session opened");
        SessionLockManager::new(
            key,
            Arc::clone(&self.shared.sync),
            Arc::clone(&self.shared.registry),
        )
    }

    /// Tears a session down: aborts all of its locks, including ones still
    /// establishing on other threads, and drops its deletion protections.
    pub fn end_session(&self, session: &SessionLockManager) -> Result<()> {
        let released = session.release_all_locks();
        self.shared.deletion.release_session(session.key());
        tracing::debug!(key = %session.key(), "session ended");
        released
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        self.shared.sync.stats()
    }

    /// Closes the gate: every write establish, waiting or future, fails
    /// with `reason`.
    pub fn disable_operations(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "operations disabled");
        self.shared.sync.set_operations_status(Some(reason));
    }

    pub fn enable_operations(&self) {
        tracing::info!("operations enabled");
        self.shared.sync.set_operations_status(None);
    }

    /// Publishes the graceful-shutdown notice. Write establishes keep
    /// waiting rather than failing.
    pub fn begin_shutdown(&self) {
        tracing::info!("graceful shutdown started");
        self.shared
            .sync
            .set_operations_status(Some(SHUTDOWN_NOTICE.to_string()));
    }

    /// `None` while operations are enabled.
    pub fn operations_status(&self) -> Option<String> {
        self.shared.sync.gate().check_enabled()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("partitions", &self.shared.registry.len())
            .field("stats", &self.shared.sync.stats())
            .field("operations_status", &self.operations_status())
            .finish()
    }
}
