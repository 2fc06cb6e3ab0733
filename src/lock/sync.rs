//! # LockSync: The Shared Lock Monitor
//!
//! Every lock kind and every partition is coordinated through one
//! `LockSync`. It is the only mutex in the establish/release path, which is
//! what makes multi-partition acquisition atomic: the readiness check over
//! all targets and the registration on all targets happen inside a single
//! critical section.
//!
//! ## Layout
//!
//! ```text
//! LockSync {
//!     state: Mutex<SyncState> {
//!         partitions: HashMap<PartitionId, PartitionQueues>,   // lazily created, pruned when idle
//!         owners:     HashMap<OwnerKey, OwnerEntry>,           // who holds what
//!         locks:      HashMap<LockId, LockRecord>,             // lifecycle of every live handle
//!     },
//!     changed: Condvar,        // broadcast on every state change
//!     gate:    OperationsGate, // server "operations enabled" status
//!     stats:   LockStats,      // held / waiting counters for monitoring
//! }
//! ```
//!
//! ## Owner Table
//!
//! An owner key maps to either one exclusive (write or dump) lock, or a list
//! of read locks. A key holding a non-read lock can claim nothing else, and
//! a write or dump claim needs a key that holds nothing at all. This is the
//! deadlock firewall: no owner ever waits on one of its own locks.
//!
//! ## Waiting
//!
//! Waiters block on `changed` with a bounded timeout (the recheck interval)
//! and re-evaluate their predicate on every wakeup, whether it came from a
//! broadcast or from the timeout.
//!
//! ## Counters
//!
//! `LockStats` counters are only modified while the monitor is held, and
//! read lock-free by monitoring code. A decrement below zero is reported as
//! an invariant violation.

use crate::config::{
    DEFAULT_RECHECK_INTERVAL, OWNER_READS_INLINE_CAPACITY, QUEUE_INLINE_CAPACITY,
    READER_INLINE_CAPACITY,
};
use crate::error::LockError;
use crate::lock::gate::OperationsGate;
use crate::lock::{Lock, LockId, LockInner, LockKind, LockState, OwnerKey};
use crate::partition::{Partition, PartitionId};
use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::Duration;

/// Lock queues of a single partition. Only reachable through the monitor.
#[derive(Debug, Default)]
pub(crate) struct PartitionQueues {
    pub(crate) writer: Option<LockId>,
    pub(crate) readers: SmallVec<[LockId; READER_INLINE_CAPACITY]>,
    pub(crate) dumpers: SmallVec<[LockId; QUEUE_INLINE_CAPACITY]>,
    pub(crate) waiting_writers: SmallVec<[LockId; QUEUE_INLINE_CAPACITY]>,
    pub(crate) waiting_dumpers: SmallVec<[LockId; QUEUE_INLINE_CAPACITY]>,
}

impl PartitionQueues {
    fn is_idle(&self) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self.dumpers.is_empty()
            && self.waiting_writers.is_empty()
            && self.waiting_dumpers.is_empty()
    }

    /// A writer never shares a partition with a reader, a dumper, or another writer.
    pub(crate) fn exclusion_holds(&self) -> bool {
        self.writer.is_none() || (self.readers.is_empty() && self.dumpers.is_empty())
    }
}

/// Removes `id` from `list`, returning whether it was present.
pub(crate) fn remove_id<A: smallvec::Array<Item = LockId>>(
    list: &mut SmallVec<A>,
    id: LockId,
) -> bool {
    match list.iter().position(|entry| *entry == id) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

#[derive(Debug)]
enum OwnerEntry {
    Exclusive { lock: LockId, kind: LockKind },
    Readers(SmallVec<[LockId; OWNER_READS_INLINE_CAPACITY]>),
}

/// Bookkeeping for one live lock handle.
#[derive(Debug)]
pub(crate) struct LockRecord {
    pub(crate) state: LockState,
    pub(crate) aborting: bool,
    pub(crate) owner: Option<OwnerKey>,
    handle: Weak<LockInner>,
}

impl LockRecord {
    pub(crate) fn new(handle: Weak<LockInner>) -> Self {
        Self {
            state: LockState::Idle,
            aborting: false,
            owner: None,
            handle,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SyncState {
    partitions: HashMap<PartitionId, PartitionQueues>,
    owners: HashMap<OwnerKey, OwnerEntry>,
    locks: HashMap<LockId, LockRecord>,
}

impl SyncState {
    pub(crate) fn record(&self, id: LockId) -> Result<&LockRecord, LockError> {
        self.locks
            .get(&id)
            .ok_or_else(|| LockError::Invariant(format!("lock {id} has no record")))
    }

    pub(crate) fn record_mut(&mut self, id: LockId) -> Result<&mut LockRecord, LockError> {
        self.locks
            .get_mut(&id)
            .ok_or_else(|| LockError::Invariant(format!("lock {id} has no record")))
    }

    pub(crate) fn insert_record(&mut self, id: LockId, record: LockRecord) {
        self.locks.insert(id, record);
    }

    pub(crate) fn remove_record(&mut self, id: LockId) {
        self.locks.remove(&id);
    }

    pub(crate) fn queues(&self, partition: PartitionId) -> Option<&PartitionQueues> {
        self.partitions.get(&partition)
    }

    pub(crate) fn queues_mut(&mut self, partition: PartitionId) -> &mut PartitionQueues {
        self.partitions.entry(partition).or_default()
    }

    /// Drops the queue entry of a partition nobody is using any more.
    pub(crate) fn prune(&mut self, partition: PartitionId) {
        if self
            .partitions
            .get(&partition)
            .is_some_and(PartitionQueues::is_idle)
        {
            self.partitions.remove(&partition);
        }
    }

    /// Whether `key` holds an active read lock other than `except`.
    pub(crate) fn owner_holds_reads(&self, key: OwnerKey, except: LockId) -> bool {
        let Some(OwnerEntry::Readers(reads)) = self.owners.get(&key) else {
            return false;
        };
        reads.iter().any(|read| {
            *read != except
                && self
                    .locks
                    .get(read)
                    .is_some_and(|record| record.state == LockState::Locked)
        })
    }

    pub(crate) fn claim_lock_key(&mut self, key: OwnerKey, lock: LockId, kind: LockKind) -> bool {
        if kind != LockKind::Read {
            if self.owners.contains_key(&key) {
                return false;
            }
            self.owners.insert(key, OwnerEntry::Exclusive { lock, kind });
            return true;
        }

        match self.owners.get_mut(&key) {
            Some(OwnerEntry::Exclusive { .. }) => false,
            Some(OwnerEntry::Readers(reads)) => {
                if !reads.contains(&lock) {
                    reads.push(lock);
                }
                true
            }
            None => {
                self.owners
                    .insert(key, OwnerEntry::Readers(smallvec::smallvec![lock]));
                true
            }
        }
    }

    pub(crate) fn unclaim_lock_key(
        &mut self,
        key: OwnerKey,
        lock: LockId,
        kind: LockKind,
    ) -> Result<(), LockError> {
        let now_empty = match self.owners.get_mut(&key) {
            Some(OwnerEntry::Readers(reads)) if kind == LockKind::Read => {
                if !remove_id(reads, lock) {
                    return Err(LockError::Invariant(format!(
                        "{key} does not hold read lock {lock}"
                    )));
                }
                reads.is_empty()
            }
            Some(OwnerEntry::Exclusive {
                lock: held,
                kind: held_kind,
            }) => {
                if *held != lock {
                    return Err(LockError::Invariant(format!(
                        "{key} holds {held_kind:?} lock {held}, not {kind:?} lock {lock}"
                    )));
                }
                true
            }
            Some(OwnerEntry::Readers(_)) => {
                return Err(LockError::Invariant(format!(
                    "{key} holds only read locks, not {kind:?} lock {lock}"
                )));
            }
            None => {
                return Err(LockError::Invariant(format!(
                    "{key} holds no locks, cannot release {lock}"
                )));
            }
        };
        if now_empty {
            self.owners.remove(&key);
        }
        Ok(())
    }

    fn exclusive_held(&self, key: OwnerKey) -> Option<(LockId, LockKind)> {
        match self.owners.get(&key) {
            Some(OwnerEntry::Exclusive { lock, kind }) => Some((*lock, *kind)),
            _ => None,
        }
    }

    fn claim_count(&self, key: OwnerKey) -> usize {
        match self.owners.get(&key) {
            Some(OwnerEntry::Exclusive { .. }) => 1,
            Some(OwnerEntry::Readers(reads)) => reads.len(),
            None => 0,
        }
    }

    pub(crate) fn describe_claims(&self, key: OwnerKey) -> String {
        match self.exclusive_held(key) {
            Some((lock, kind)) => format!("already holds {} {lock}", kind.name()),
            None => format!("already holds {} read lock(s)", self.claim_count(key)),
        }
    }
}

/// Monitoring counters. Mutated only under the monitor.
#[derive(Debug, Default)]
pub struct LockStats {
    held: AtomicUsize,
    waiting: AtomicUsize,
    established_total: AtomicU64,
    interrupted_total: AtomicU64,
}

impl LockStats {
    pub(crate) fn inc_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_waiting(&self) -> Result<(), LockError> {
        Self::checked_dec(&self.waiting, "waiting")
    }

    pub(crate) fn inc_held(&self) {
        self.held.fetch_add(1, Ordering::Relaxed);
        self.established_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_held(&self) -> Result<(), LockError> {
        Self::checked_dec(&self.held, "held")
    }

    pub(crate) fn record_interrupted(&self) {
        self.interrupted_total.fetch_add(1, Ordering::Relaxed);
    }

    fn checked_dec(counter: &AtomicUsize, name: &str) -> Result<(), LockError> {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| {
                tracing::error!(counter = name, "lock counter would go negative");
                LockError::Invariant(format!("{name} lock count went negative"))
            })
    }

    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            held: self.held.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            established_total: self.established_total.load(Ordering::Relaxed),
            interrupted_total: self.interrupted_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LockStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub held: usize,
    pub waiting: usize,
    pub established_total: u64,
    pub interrupted_total: u64,
}

impl fmt::Display for LockStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "held:{},waiting:{},established:{},interrupted:{}",
            self.held, self.waiting, self.established_total, self.interrupted_total
        )
    }
}

/// Queue sizes of one partition, for monitoring and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub writer: Option<LockId>,
    pub readers: usize,
    pub dumpers: usize,
    pub waiting_writers: usize,
    pub waiting_dumpers: usize,
}

impl PartitionSnapshot {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for PartitionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.writer {
            Some(writer) => write!(f, "writer:{writer}")?,
            None => f.write_str("writer:-")?,
        }
        write!(
            f,
            ",readers:{},dumpers:{},waiting_writers:{},waiting_dumpers:{}",
            self.readers, self.dumpers, self.waiting_writers, self.waiting_dumpers
        )
    }
}

/// The monitor shared by every lock and partition of one lock manager.
pub struct LockSync {
    state: Mutex<SyncState>,
    changed: Condvar,
    gate: OperationsGate,
    stats: LockStats,
    recheck_interval: Duration,
    next_lock_id: AtomicU64,
}

impl Default for LockSync {
    fn default() -> Self {
        Self::new(DEFAULT_RECHECK_INTERVAL)
    }
}

impl fmt::Debug for LockSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSync")
            .field("stats", &self.stats.snapshot())
            .field("recheck_interval", &self.recheck_interval)
            .field("operations_status", &self.gate.check_enabled())
            .finish()
    }
}

impl LockSync {
    pub fn new(recheck_interval: Duration) -> Self {
        Self {
            state: Mutex::new(SyncState::default()),
            changed: Condvar::new(),
            gate: OperationsGate::new(),
            stats: LockStats::default(),
            recheck_interval,
            next_lock_id: AtomicU64::new(1),
        }
    }

    pub fn recheck_interval(&self) -> Duration {
        self.recheck_interval
    }

    pub(crate) fn next_lock_id(&self) -> LockId {
        LockId(self.next_lock_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock()
    }

    /// Blocks until the next broadcast or the recheck interval elapses.
    pub(crate) fn wait(&self, state: &mut MutexGuard<'_, SyncState>) {
        // Timeouts are expected; the caller re-checks its predicate either way.
        let _ = self.changed.wait_for(state, self.recheck_interval);
    }

    pub(crate) fn notify_all(&self) {
        self.changed.notify_all();
    }

    pub(crate) fn stats_ref(&self) -> &LockStats {
        &self.stats
    }

    pub fn gate(&self) -> &OperationsGate {
        &self.gate
    }

    /// Publishes a new operations status and wakes every blocked establisher.
    pub fn set_operations_status(&self, status: Option<String>) {
        let _state = self.state.lock();
        self.gate.set(status);
        self.changed.notify_all();
    }

    /// Registers `lock` under `key`. Returns false if the key already owns a
    /// conflicting registration, or if `lock` belongs to another monitor.
    ///
    /// `Lock::establish` and `Lock::release` maintain the owner table
    /// themselves; this and [`unclaim_lock_key`](Self::unclaim_lock_key) are
    /// for inspection and tests.
    pub fn claim_lock_key(&self, key: OwnerKey, lock: &Lock) -> bool {
        if !lock.belongs_to(self) {
            return false;
        }
        self.state.lock().claim_lock_key(key, lock.id(), lock.kind())
    }

    /// Removes the registration of `lock` under `key`. Refused while the
    /// lock is establishing or held, since its own release owns that
    /// registration.
    pub fn unclaim_lock_key(&self, key: OwnerKey, lock: &Lock) -> Result<()> {
        if !lock.belongs_to(self) {
            return Err(LockError::Invariant(format!(
                "lock {} belongs to another lock monitor",
                lock.id()
            ))
            .into());
        }
        let mut state = self.state.lock();
        let lifecycle = state.record(lock.id())?.state;
        if matches!(lifecycle, LockState::Establishing | LockState::Locked) {
            return Err(LockError::InvalidState {
                lock: lock.id(),
                state: lifecycle.as_str(),
                operation: "unclaim",
            }
            .into());
        }
        let result = state.unclaim_lock_key(key, lock.id(), lock.kind());
        if let Err(err) = &result {
            tracing::error!(key = %key, lock = %lock.id(), error = %err, "unclaim mismatch");
        }
        Ok(result?)
    }

    /// The single write or dump lock held by `key`, if any.
    pub fn lock_held(&self, key: OwnerKey) -> Option<Lock> {
        let state = self.state.lock();
        let (id, _) = state.exclusive_held(key)?;
        state
            .locks
            .get(&id)
            .and_then(|record| record.handle.upgrade())
            .map(Lock::from_inner)
    }

    /// Whether `key` has any registration at all.
    pub fn holds_any(&self, key: OwnerKey) -> bool {
        self.state.lock().owners.contains_key(&key)
    }

    /// Number of locks registered under `key`.
    pub fn claim_count(&self, key: OwnerKey) -> usize {
        self.state.lock().claim_count(key)
    }

    /// Number of distinct owner keys with at least one registration.
    pub fn keys_holding(&self) -> usize {
        self.state.lock().owners.len()
    }

    pub fn locks_held(&self) -> usize {
        self.stats.held.load(Ordering::Relaxed)
    }

    pub fn locks_waiting(&self) -> usize {
        self.stats.waiting.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn partition_snapshot(&self, partition: &Partition) -> PartitionSnapshot {
        let state = self.state.lock();
        state
            .queues(partition.id())
            .map(|queues| PartitionSnapshot {
                writer: queues.writer,
                readers: queues.readers.len(),
                dumpers: queues.dumpers.len(),
                waiting_writers: queues.waiting_writers.len(),
                waiting_dumpers: queues.waiting_dumpers.len(),
            })
            .unwrap_or_default()
    }

    /// Checks writer exclusion on every partition with live queues.
    pub fn verify_exclusion(&self) -> Result<()> {
        let state = self.state.lock();
        for (partition, queues) in &state.partitions {
            if !queues.exclusion_holds() {
                return Err(LockError::Invariant(format!(
                    "{partition} has writer {:?} alongside {} reader(s) and {} dumper(s)",
                    queues.writer,
                    queues.readers.len(),
                    queues.dumpers.len()
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SyncState {
        SyncState::default()
    }

    #[test]
    fn key_may_accumulate_read_claims() {
        let mut s = state();
        assert!(s.claim_lock_key(OwnerKey(1), LockId(1), LockKind::Read));
        assert!(s.claim_lock_key(OwnerKey(1), LockId(2), LockKind::Read));
        assert_eq!(s.claim_count(OwnerKey(1)), 2);
    }

    #[test]
    fn exclusive_claim_needs_an_empty_key() {
        let mut s = state();
        assert!(s.claim_lock_key(OwnerKey(1), LockId(1), LockKind::Read));
        assert!(!s.claim_lock_key(OwnerKey(1), LockId(2), LockKind::Write));
        assert!(!s.claim_lock_key(OwnerKey(1), LockId(3), LockKind::Dump));
        assert!(s.claim_lock_key(OwnerKey(2), LockId(4), LockKind::Dump));
    }

    #[test]
    fn exclusive_claim_blocks_everything_else() {
        let mut s = state();
        assert!(s.claim_lock_key(OwnerKey(1), LockId(1), LockKind::Write));
        assert!(!s.claim_lock_key(OwnerKey(1), LockId(2), LockKind::Read));
        assert!(!s.claim_lock_key(OwnerKey(1), LockId(3), LockKind::Write));
        assert_eq!(s.exclusive_held(OwnerKey(1)), Some((LockId(1), LockKind::Write)));
    }

    #[test]
    fn unclaim_removes_empty_keys() {
        let mut s = state();
        s.claim_lock_key(OwnerKey(1), LockId(1), LockKind::Read);
        s.unclaim_lock_key(OwnerKey(1), LockId(1), LockKind::Read).unwrap();
        assert_eq!(s.claim_count(OwnerKey(1)), 0);
        assert!(s.claim_lock_key(OwnerKey(1), LockId(2), LockKind::Write));
    }

    #[test]
    fn unclaim_mismatch_is_an_invariant_violation() {
        let mut s = state();
        s.claim_lock_key(OwnerKey(1), LockId(1), LockKind::Write);
        let err = s
            .unclaim_lock_key(OwnerKey(1), LockId(2), LockKind::Write)
            .unwrap_err();
        assert!(matches!(err, LockError::Invariant(_)));

        let err = s
            .unclaim_lock_key(OwnerKey(7), LockId(1), LockKind::Read)
            .unwrap_err();
        assert!(matches!(err, LockError::Invariant(_)));
    }

    #[test]
    fn held_counter_never_goes_negative() {
        let stats = LockStats::default();
        stats.inc_held();
        stats.dec_held().unwrap();
        assert!(matches!(stats.dec_held(), Err(LockError::Invariant(_))));
        assert_eq!(stats.snapshot().held, 0);
        assert_eq!(stats.snapshot().established_total, 1);
    }

    #[test]
    fn idle_partitions_are_pruned() {
        let mut s = state();
        let pid = PartitionId(3);
        s.queues_mut(pid).readers.push(LockId(1));
        s.prune(pid);
        assert!(s.queues(pid).is_some());
        remove_id(&mut s.queues_mut(pid).readers, LockId(1));
        s.prune(pid);
        assert!(s.queues(pid).is_none());
    }

    #[test]
    fn owner_holds_reads_counts_only_other_active_reads() {
        let mut s = state();
        s.claim_lock_key(OwnerKey(1), LockId(1), LockKind::Read);
        s.claim_lock_key(OwnerKey(1), LockId(2), LockKind::Read);
        s.insert_record(LockId(1), LockRecord::new(Weak::new()));
        s.insert_record(LockId(2), LockRecord::new(Weak::new()));
        assert!(!s.owner_holds_reads(OwnerKey(1), LockId(2)));

        s.record_mut(LockId(1)).unwrap().state = LockState::Locked;
        assert!(s.owner_holds_reads(OwnerKey(1), LockId(2)));
        assert!(!s.owner_holds_reads(OwnerKey(1), LockId(1)));
        assert!(!s.owner_holds_reads(OwnerKey(2), LockId(2)));
    }

    #[test]
    fn public_claims_cannot_touch_a_held_lock() {
        let sync = std::sync::Arc::new(LockSync::new(Duration::from_millis(10)));
        let held = Lock::write(&sync, &[]);
        held.establish(OwnerKey(1)).unwrap();

        let report = sync.unclaim_lock_key(OwnerKey(1), &held).unwrap_err();
        assert!(matches!(
            crate::error::lock_error(&report),
            Some(LockError::InvalidState { operation: "unclaim", .. })
        ));
        held.release().unwrap();
        assert!(!sync.holds_any(OwnerKey(1)));

        let idle = Lock::read(&sync, &[]);
        assert!(sync.claim_lock_key(OwnerKey(2), &idle));
        sync.unclaim_lock_key(OwnerKey(2), &idle).unwrap();
        assert!(!sync.holds_any(OwnerKey(2)));
    }

    #[test]
    fn public_claims_reject_locks_of_another_monitor() {
        let sync = std::sync::Arc::new(LockSync::new(Duration::from_millis(10)));
        let other = std::sync::Arc::new(LockSync::new(Duration::from_millis(10)));
        let foreign = Lock::read(&other, &[]);
        assert!(!sync.claim_lock_key(OwnerKey(1), &foreign));
        assert!(sync.unclaim_lock_key(OwnerKey(1), &foreign).is_err());
        assert_eq!(sync.keys_holding(), 0);
    }

    #[test]
    fn snapshot_display() {
        let snap = LockStatsSnapshot {
            held: 2,
            waiting: 1,
            established_total: 5,
            interrupted_total: 0,
        };
        assert_eq!(snap.to_string(), "held:2,waiting:1,established:5,interrupted:0");
    }
}
