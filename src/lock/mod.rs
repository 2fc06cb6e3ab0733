//! # Multi-Granularity Locks
//!
//! A [`Lock`] covers a fixed set of partitions chosen at construction and
//! comes in three kinds:
//!
//! | Kind   | Shares with        | Blocks on                                   |
//! |--------|--------------------|---------------------------------------------|
//! | Read   | readers, dumpers   | active writer, queued writer                |
//! | Dump   | readers, dumpers   | active writer                               |
//! | Write  | nothing            | dumpers (active or queued), then everything |
//!
//! ## Lifecycle
//!
//! ```text
//!              establish()                 success
//!   ┌──────┐ ─────────────> ┌──────────────┐ ───────> ┌────────┐
//!   │ Idle │                │ Establishing │          │ Locked │
//!   └──────┘ <───────────── └──────────────┘          └────────┘
//!      ^      gate closed          │ abort()              │
//!      │                           v                      │
//!      │                     ┌─────────┐    abort()       │
//!      │                     │ Aborted │ <────────────────┤
//!      │                     └─────────┘                  │
//!      └──────────────────────────────────────────────────┘
//!                             release()
//! ```
//!
//! `Aborted` is terminal. A lock is `Locked` exactly when it is registered
//! as active on every one of its partitions.
//!
//! ## Atomic Acquisition
//!
//! All kinds share one acquisition loop ([`Lock::establish`]). Under the
//! [`LockSync`] monitor it evaluates the kind's readiness predicate on
//! *every* target partition, and only when all of them pass does it apply
//! the kind's registration step to all of them, still inside the same
//! critical section. A lock therefore never holds a subset of its targets
//! while waiting for the rest.
//!
//! Write locks have two stages (wait out dumpers, then queue and wait for
//! the partitions to drain); read and dump locks have one. The per-kind
//! behavior lives in [`read`], [`write`] and [`dump`].
//!
//! ## Cancellation
//!
//! [`Lock::abort`] is callable from any thread. It flags the lock, wakes the
//! monitor, waits for a concurrent `establish` to unwind with
//! [`LockError::Interrupted`], and then releases whatever is held.

pub mod dump;
pub mod gate;
pub mod read;
pub mod sync;
pub mod write;

pub use gate::OperationsGate;
pub use sync::{LockStats, LockStatsSnapshot, LockSync, PartitionSnapshot};

use crate::error::LockError;
use crate::partition::{normalize, Partition, PartitionId};
use eyre::Result;
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::Arc;
use sync::{LockRecord, PartitionQueues, SyncState};

/// Identity of one lock handle, unique within a [`LockSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque per-session identity used to detect self-conflicting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey(pub u64);

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Read,
    Write,
    Dump,
}

impl LockKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read lock",
            Self::Write => "write lock",
            Self::Dump => "dump lock",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Read => "ReadLock",
            Self::Write => "WriteLock",
            Self::Dump => "DumpLock",
        }
    }

    fn protocol(self) -> &'static dyn LockProtocol {
        match self {
            Self::Read => &read::ReadLock,
            Self::Write => &write::WriteLock,
            Self::Dump => &dump::DumpLock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Idle,
    Establishing,
    Locked,
    Aborted,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Establishing => "establishing",
            Self::Locked => "locked",
            Self::Aborted => "aborted",
        }
    }
}

/// What a readiness predicate may look at for one target partition.
pub(crate) struct StageView<'a> {
    pub(crate) queues: &'a PartitionQueues,
    /// The owner already holds another active read lock.
    pub(crate) owner_holds_reads: bool,
}

/// Per-kind half of the acquisition protocol. The shared loop in
/// [`Lock::establish`] drives it; implementations only describe queues.
pub(crate) trait LockProtocol: Sync {
    fn stages(&self) -> u8 {
        1
    }

    /// Registration made before the first wait. Must not block.
    fn enqueue(&self, _id: LockId, _queues: &mut PartitionQueues) {}

    fn ready(&self, stage: u8, view: &StageView<'_>) -> bool;

    /// Applied to every target once `ready` holds on all of them. The last
    /// stage's advance makes the lock active.
    fn advance(&self, stage: u8, id: LockId, queues: &mut PartitionQueues);

    /// Undoes any waiting-list registration left by an unwound establish.
    fn withdraw(&self, _id: LockId, _queues: &mut PartitionQueues) {}

    /// Removes the active registration. Returns false if it was missing.
    fn release(&self, id: LockId, queues: &mut PartitionQueues) -> bool;

    fn consults_gate(&self) -> bool {
        false
    }
}

pub(crate) struct LockInner {
    id: LockId,
    kind: LockKind,
    partitions: Arc<[Partition]>,
    sync: Arc<LockSync>,
}

/// Shared handle to a lock. Clones refer to the same lock.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub fn read(sync: &Arc<LockSync>, partitions: &[Partition]) -> Self {
        Self::new(sync, LockKind::Read, partitions)
    }

    pub fn write(sync: &Arc<LockSync>, partitions: &[Partition]) -> Self {
        Self::new(sync, LockKind::Write, partitions)
    }

    pub fn dump(sync: &Arc<LockSync>, partitions: &[Partition]) -> Self {
        Self::new(sync, LockKind::Dump, partitions)
    }

    pub fn new(sync: &Arc<LockSync>, kind: LockKind, partitions: &[Partition]) -> Self {
        let inner = Arc::new(LockInner {
            id: sync.next_lock_id(),
            kind,
            partitions: normalize(partitions),
            sync: Arc::clone(sync),
        });
        sync.lock_state()
            .insert_record(inner.id, LockRecord::new(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<LockInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> LockId {
        self.inner.id
    }

    pub fn kind(&self) -> LockKind {
        self.inner.kind
    }

    /// Target partitions, name-ordered and deduplicated.
    pub fn partitions(&self) -> &[Partition] {
        &self.inner.partitions
    }

    pub fn covers(&self, partition: &Partition) -> bool {
        self.inner.partitions.binary_search(partition).is_ok()
    }

    pub fn overlaps_any(&self, partitions: &[Partition]) -> bool {
        partitions.iter().any(|p| self.covers(p))
    }

    pub fn overlaps(&self, other: &Lock) -> bool {
        self.overlaps_any(other.partitions())
    }

    pub fn state(&self) -> LockState {
        self.inner
            .sync
            .lock_state()
            .record(self.inner.id)
            .map(|record| record.state)
            .unwrap_or(LockState::Aborted)
    }

    pub fn is_locked(&self) -> bool {
        self.state() == LockState::Locked
    }

    pub fn is_establishing(&self) -> bool {
        self.state() == LockState::Establishing
    }

    pub fn is_aborting(&self) -> bool {
        self.inner
            .sync
            .lock_state()
            .record(self.inner.id)
            .is_ok_and(|record| record.aborting)
    }

    pub(crate) fn belongs_to(&self, sync: &LockSync) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner.sync), sync)
    }

    /// The key this lock is held or being established under.
    pub fn owner(&self) -> Option<OwnerKey> {
        self.inner
            .sync
            .lock_state()
            .record(self.inner.id)
            .ok()
            .and_then(|record| record.owner)
    }

    /// Blocks until the lock is active on every target partition.
    ///
    /// Fails immediately with [`LockError::SelfConflict`] if `key` already
    /// owns a conflicting lock, and with [`LockError::Interrupted`] if
    /// [`abort`](Self::abort) is called while waiting. Write locks also fail
    /// with [`LockError::OperationsDisabled`] when the server gate closes.
    pub fn establish(&self, key: OwnerKey) -> Result<()> {
        let inner = &*self.inner;
        let sync = &*inner.sync;
        let protocol = inner.kind.protocol();
        let mut state = sync.lock_state();

        let record = state.record(inner.id)?;
        if record.aborting || record.state == LockState::Aborted {
            return Err(LockError::Interrupted { lock: inner.id }.into());
        }
        if record.state != LockState::Idle {
            return Err(LockError::InvalidState {
                lock: inner.id,
                state: record.state.as_str(),
                operation: "establish",
            }
            .into());
        }

        if !state.claim_lock_key(key, inner.id, inner.kind) {
            let reason = state.describe_claims(key);
            tracing::debug!(lock = %inner.id, key = %key, kind = ?inner.kind, %reason, "self-conflicting lock request");
            return Err(LockError::SelfConflict {
                key,
                requested: inner.kind.name(),
                reason,
            }
            .into());
        }

        {
            let record = state.record_mut(inner.id)?;
            record.state = LockState::Establishing;
            record.owner = Some(key);
        }
        sync.stats_ref().inc_waiting();
        for partition in inner.partitions.iter() {
            protocol.enqueue(inner.id, state.queues_mut(partition.id()));
        }
        tracing::debug!(lock = %inner.id, key = %key, kind = ?inner.kind, "establishing lock");

        let outcome = inner.acquire_all(&mut state, protocol, key);
        let finished = inner.finish_establish(&mut state, protocol, key, &outcome);
        sync.notify_all();
        drop(state);

        match (outcome, finished) {
            (Ok(()), Ok(())) => {
                tracing::debug!(lock = %inner.id, key = %key, kind = ?inner.kind, "lock established");
                Ok(())
            }
            (Err(err), _) => {
                tracing::warn!(lock = %inner.id, key = %key, kind = ?inner.kind, error = %err, "lock establishment failed");
                Err(err.into())
            }
            (Ok(()), Err(err)) => {
                tracing::error!(lock = %inner.id, key = %key, error = %err, "lock bookkeeping failed after establish");
                Err(err.into())
            }
        }
    }

    /// Releases the lock. Waits for a concurrent `establish` on this handle
    /// to finish first; releasing a lock that is not held is a no-op.
    pub fn release(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut state = inner.sync.lock_state();
        while state.record(inner.id)?.state == LockState::Establishing {
            inner.sync.wait(&mut state);
        }
        Ok(inner.release_in(&mut state)?)
    }

    /// Cancels the lock from any thread. A blocked `establish` unwinds with
    /// [`LockError::Interrupted`]; a held lock is released. Terminal.
    pub fn abort(&self) -> Result<()> {
        let inner = &*self.inner;
        let sync = &*inner.sync;
        let mut state = sync.lock_state();

        state.record_mut(inner.id)?.aborting = true;
        sync.notify_all();
        tracing::debug!(lock = %inner.id, kind = ?inner.kind, "aborting lock");

        while state.record(inner.id)?.state == LockState::Establishing {
            sync.wait(&mut state);
        }
        let released = inner.release_in(&mut state);
        state.record_mut(inner.id)?.state = LockState::Aborted;
        Ok(released?)
    }
}

impl LockInner {
    fn stage_ready(
        &self,
        state: &SyncState,
        protocol: &dyn LockProtocol,
        stage: u8,
        key: OwnerKey,
    ) -> bool {
        let empty = PartitionQueues::default();
        let owner_holds_reads = state.owner_holds_reads(key, self.id);
        self.partitions.iter().all(|partition| {
            let view = StageView {
                queues: state.queues(partition.id()).unwrap_or(&empty),
                owner_holds_reads,
            };
            protocol.ready(stage, &view)
        })
    }

    fn acquire_all(
        &self,
        state: &mut MutexGuard<'_, SyncState>,
        protocol: &dyn LockProtocol,
        key: OwnerKey,
    ) -> Result<(), LockError> {
        let mut stage = 0;
        loop {
            if state.record(self.id)?.aborting {
                return Err(LockError::Interrupted { lock: self.id });
            }
            if protocol.consults_gate() {
                if let Some(message) = self.sync.gate().rejection() {
                    return Err(LockError::OperationsDisabled(message));
                }
            }

            if self.stage_ready(state, protocol, stage, key) {
                for partition in self.partitions.iter() {
                    protocol.advance(stage, self.id, state.queues_mut(partition.id()));
                }
                stage += 1;
                if stage == protocol.stages() {
                    debug_assert!(self.partitions.iter().all(|p| state
                        .queues(p.id())
                        .is_some_and(PartitionQueues::exclusion_holds)));
                    return Ok(());
                }
                // Entering a waiting list changes what other waiters may do.
                self.sync.notify_all();
                continue;
            }

            self.sync.wait(state);
        }
    }

    /// Settles bookkeeping after the acquire loop, whatever its outcome.
    fn finish_establish(
        &self,
        state: &mut SyncState,
        protocol: &dyn LockProtocol,
        key: OwnerKey,
        outcome: &Result<(), LockError>,
    ) -> Result<(), LockError> {
        let stats = self.sync.stats_ref();
        let waiting = stats.dec_waiting();

        if outcome.is_ok() {
            state.record_mut(self.id)?.state = LockState::Locked;
            stats.inc_held();
            return waiting;
        }

        for partition in self.partitions.iter() {
            protocol.withdraw(self.id, state.queues_mut(partition.id()));
            state.prune(partition.id());
        }
        let record = state.record_mut(self.id)?;
        record.state = if record.aborting {
            LockState::Aborted
        } else {
            LockState::Idle
        };
        record.owner = None;
        if matches!(outcome, Err(LockError::Interrupted { .. })) {
            stats.record_interrupted();
        }
        let unclaimed = state.unclaim_lock_key(key, self.id, self.kind);
        waiting.and(unclaimed)
    }

    /// Deregisters a held lock from every partition and from the owner table.
    fn release_in(&self, state: &mut SyncState) -> Result<(), LockError> {
        let record = state.record(self.id)?;
        if record.state != LockState::Locked {
            return Ok(());
        }
        let key = record.owner.ok_or_else(|| {
            LockError::Invariant(format!("locked lock {} has no owner", self.id))
        })?;

        let protocol = self.kind.protocol();
        let mut missing: Vec<PartitionId> = Vec::new();
        for partition in self.partitions.iter() {
            if !protocol.release(self.id, state.queues_mut(partition.id())) {
                missing.push(partition.id());
            }
            state.prune(partition.id());
        }

        let record = state.record_mut(self.id)?;
        record.state = LockState::Idle;
        record.owner = None;
        let unclaimed = state.unclaim_lock_key(key, self.id, self.kind);
        let counted = self.sync.stats_ref().dec_held();
        self.sync.notify_all();
        tracing::debug!(lock = %self.id, key = %key, kind = ?self.kind, "lock released");

        if !missing.is_empty() {
            let err = LockError::Invariant(format!(
                "lock {} was not registered on {missing:?}",
                self.id
            ));
            tracing::error!(lock = %self.id, error = %err, "release found partial registration");
            return Err(err);
        }
        unclaimed.and(counted).inspect_err(|err| {
            tracing::error!(lock = %self.id, error = %err, "release bookkeeping failed");
        })
    }
}

impl Drop for LockInner {
    fn drop(&mut self) {
        let mut state = self.sync.lock_state();
        if let Err(err) = self.release_in(&mut state) {
            tracing::error!(lock = %self.id, error = %err, "failed to release dropped lock");
        }
        state.remove_record(self.id);
    }
}

impl PartialEq for Lock {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Lock {}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} [", self.inner.kind.label(), self.inner.id)?;
        for (i, partition) in self.inner.partitions.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(partition.name())?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("partitions", &self.inner.partitions)
            .finish()
    }
}
