//! # Session Lock Management
//!
//! Each user session owns one `SessionLockManager`. It remembers which locks
//! the session holds and turns away requests that would conflict with them
//! before anything reaches the shared monitor:
//!
//! | Request | Rejected when the session holds              |
//! |---------|----------------------------------------------|
//! | read    | a write lock overlapping the requested set   |
//! | write   | any lock at all                              |
//! | dump    | a write lock                                 |
//!
//! The owner-key table in [`LockSync`] enforces the same rules globally;
//! this pre-check only makes the failure cheap and explicit.
//!
//! ## Bookkeeping
//!
//! A lock joins the session set *before* it starts establishing and leaves
//! it when released or when its establishment fails. That way
//! [`release_all_locks`](SessionLockManager::release_all_locks), which
//! aborts rather than releases, also reaches a lock another thread of the
//! same session is still blocked on.
//!
//! The session mutex is never held while a lock is establishing.

use crate::error::LockError;
use crate::lock::{Lock, LockKind, LockSync, OwnerKey};
use crate::partition::{Partition, PartitionRegistry};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

pub struct SessionLockManager {
    key: OwnerKey,
    sync: Arc<LockSync>,
    registry: Arc<PartitionRegistry>,
    held: Mutex<SmallVec<[Lock; 4]>>,
}

impl SessionLockManager {
    pub fn new(key: OwnerKey, sync: Arc<LockSync>, registry: Arc<PartitionRegistry>) -> Self {
        Self {
            key,
            sync,
            registry,
            held: Mutex::new(SmallVec::new()),
        }
    }

    pub fn key(&self) -> OwnerKey {
        self.key
    }

    pub fn open_read_lock(&self, partitions: &[Partition]) -> Result<Lock> {
        self.open(LockKind::Read, partitions)
    }

    /// Read lock over every registered partition.
    pub fn open_read_lock_all(&self) -> Result<Lock> {
        let partitions = self.registry.all();
        self.open(LockKind::Read, &partitions)
    }

    pub fn open_write_lock(&self, partitions: &[Partition]) -> Result<Lock> {
        self.open(LockKind::Write, partitions)
    }

    /// Dump lock over every registered partition.
    pub fn open_dump_lock(&self) -> Result<Lock> {
        let partitions = self.registry.all();
        self.open(LockKind::Dump, &partitions)
    }

    fn open(&self, kind: LockKind, partitions: &[Partition]) -> Result<Lock> {
        let lock = Lock::new(&self.sync, kind, partitions);
        {
            let mut held = self.held.lock();
            self.preflight(&lock, &held)?;
            held.push(lock.clone());
        }

        if let Err(report) = lock.establish(self.key) {
            self.forget(&lock);
            return Err(report).wrap_err_with(|| format!("{} could not establish {lock}", self.key));
        }
        Ok(lock)
    }

    fn preflight(&self, lock: &Lock, held: &[Lock]) -> Result<(), LockError> {
        let conflict = match lock.kind() {
            LockKind::Read => held
                .iter()
                .find(|h| h.kind() == LockKind::Write && h.overlaps(lock))
                .map(|h| format!("holds overlapping {h}")),
            LockKind::Write => held
                .first()
                .map(|_| format!("already holds {} lock(s)", held.len())),
            LockKind::Dump => held
                .iter()
                .find(|h| h.kind() == LockKind::Write)
                .map(|h| format!("holds {h}")),
        };

        match conflict {
            Some(reason) => {
                tracing::debug!(key = %self.key, requested = lock.kind().name(), %reason, "rejected self-conflicting request");
                Err(LockError::SelfConflict {
                    key: self.key,
                    requested: lock.kind().name(),
                    reason,
                })
            }
            None => Ok(()),
        }
    }

    fn forget(&self, lock: &Lock) -> bool {
        let mut held = self.held.lock();
        match held.iter().position(|h| h == lock) {
            Some(pos) => {
                held.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Releases one lock held by this session.
    pub fn release_lock(&self, lock: &Lock) -> Result<()> {
        if !self.held.lock().contains(lock) {
            return Err(LockError::InvalidState {
                lock: lock.id(),
                state: "not held by this session",
                operation: "release",
            }
            .into());
        }
        let released = lock.release();
        self.forget(lock);
        released
    }

    /// Aborts every lock of this session, including ones still establishing.
    /// Returns the first failure after attempting all of them.
    pub fn release_all_locks(&self) -> Result<()> {
        let locks: SmallVec<[Lock; 4]> = std::mem::take(&mut *self.held.lock());
        if !locks.is_empty() {
            tracing::debug!(key = %self.key, count = locks.len(), "releasing all session locks");
        }

        let mut first_error = None;
        for lock in &locks {
            if let Err(report) = lock.abort() {
                tracing::error!(key = %self.key, lock = %lock, error = %report, "failed to abort session lock");
                first_error.get_or_insert(report);
            }
        }
        match first_error {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }

    /// Whether `lock` belongs to this session and is currently held.
    pub fn is_locked(&self, lock: &Lock) -> bool {
        self.held.lock().contains(lock) && lock.is_locked()
    }

    pub fn has_locks(&self) -> bool {
        !self.held.lock().is_empty()
    }

    pub fn lock_count(&self) -> usize {
        self.held.lock().len()
    }

    pub fn held_locks(&self) -> Vec<Lock> {
        self.held.lock().to_vec()
    }
}

impl Drop for SessionLockManager {
    fn drop(&mut self) {
        if let Err(report) = self.release_all_locks() {
            tracing::error!(key = %self.key, error = %report, "session teardown left locks behind");
        }
    }
}

impl fmt::Debug for SessionLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLockManager")
            .field("key", &self.key)
            .field("held", &self.held.lock().len())
            .finish()
    }
}
