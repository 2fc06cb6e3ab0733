//! # Deletion Locks
//!
//! When a transaction creates an asymmetric reference to a record, it has to
//! keep that record from being deleted until the transaction ends, without
//! checking the record out for editing. The `DeletionManager` tracks these
//! reservations.
//!
//! ## Registry
//!
//! ```text
//! by_session: OwnerKey -> {Invid}     what each session protects
//! by_invid:   Invid    -> {OwnerKey}  who protects each record
//! deleting:   Invid    -> OwnerKey    records a session has begun deleting
//! ```
//!
//! `by_session` and `by_invid` are exact mirrors of each other. Empty sets
//! are removed eagerly, so a record with no protectors has no entry at all.
//!
//! ## Rules
//!
//! - A session may protect a record unless a *different* session is
//!   deleting it.
//! - A session may start deleting a record only if nobody else protects it.
//! - Batch protection is all-or-nothing.
//! - A checkpoint revert only ever removes protections (and deletion marks)
//!   added since the checkpoint.
//!
//! All operations are non-blocking and run under one short mutex.

use crate::error::LockError;
use crate::lock::OwnerKey;
use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::fmt;

/// Identifier of a record: its partition's type number plus its number
/// within that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Invid {
    pub type_id: u16,
    pub num: u32,
}

impl Invid {
    pub fn new(type_id: u16, num: u32) -> Self {
        Self { type_id, num }
    }
}

impl fmt::Display for Invid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.num)
    }
}

/// The record-side view a deletion decision needs. Implemented by the
/// object layer.
///
/// Whether a record is being deleted is decided by the manager's own
/// deletion marks alone. Neither method is called with the registry
/// locked, so an implementation may call back into the `DeletionManager`.
pub trait DeletionTarget {
    fn invid(&self) -> Invid;

    /// Notified after the manager has marked the record as being deleted
    /// by `session`. The mark itself lives in the manager; reverting it is
    /// the object layer's business when it rolls the record back.
    fn mark_deleting(&self, session: OwnerKey);
}

/// Snapshot of one session's deletion bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionCheckpoint {
    session: OwnerKey,
    protected: HashSet<Invid>,
    deleting: HashSet<Invid>,
}

impl DeletionCheckpoint {
    pub fn session(&self) -> OwnerKey {
        self.session
    }

    pub fn protected(&self) -> &HashSet<Invid> {
        &self.protected
    }

    pub fn len(&self) -> usize {
        self.protected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protected.is_empty()
    }
}

#[derive(Debug, Default)]
struct Registry {
    by_session: HashMap<OwnerKey, HashSet<Invid>>,
    by_invid: HashMap<Invid, HashSet<OwnerKey>>,
    deleting: HashMap<Invid, OwnerKey>,
}

impl Registry {
    fn protect(&mut self, session: OwnerKey, invid: Invid) {
        self.by_session.entry(session).or_default().insert(invid);
        self.by_invid.entry(invid).or_default().insert(session);
    }

    fn unprotect(&mut self, session: OwnerKey, invid: Invid) {
        if let Some(invids) = self.by_session.get_mut(&session) {
            invids.remove(&invid);
            if invids.is_empty() {
                self.by_session.remove(&session);
            }
        }
        if let Some(sessions) = self.by_invid.get_mut(&invid) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.by_invid.remove(&invid);
            }
        }
    }

    fn foreign_deleter(&self, invid: Invid, session: OwnerKey) -> Option<OwnerKey> {
        self.deleting
            .get(&invid)
            .copied()
            .filter(|deleter| *deleter != session)
    }
}

#[derive(Debug, Default)]
pub struct DeletionManager {
    registry: Mutex<Registry>,
}

impl DeletionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protects `object` from deletion on behalf of `session`.
    ///
    /// Fails if another session is already deleting the object.
    pub fn delete_lock_object<T: DeletionTarget + ?Sized>(
        &self,
        object: &T,
        session: OwnerKey,
    ) -> Result<()> {
        let invid = object.invid();
        let mut registry = self.registry.lock();

        if let Some(deleter) = registry.foreign_deleter(invid, session) {
            tracing::debug!(%invid, %session, %deleter, "deletion lock refused");
            return Err(LockError::DeletionConflict {
                invid,
                reason: format!("being deleted by {deleter}"),
            }
            .into());
        }

        registry.protect(session, invid);
        Ok(())
    }

    /// Gate a session must pass before it may delete `object`.
    ///
    /// Fails if more than one session protects the object, or if the single
    /// protector is another session. On success the object is marked as
    /// being deleted by `session`.
    pub fn set_delete_status<T: DeletionTarget + ?Sized>(
        &self,
        object: &T,
        session: OwnerKey,
    ) -> Result<()> {
        let invid = object.invid();
        let mut registry = self.registry.lock();

        if let Some(protectors) = registry.by_invid.get(&invid) {
            let reason = if protectors.len() > 1 {
                Some(format!("protected by {} sessions", protectors.len()))
            } else if !protectors.contains(&session) {
                protectors
                    .iter()
                    .next()
                    .map(|other| format!("protected by {other}"))
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::debug!(%invid, %session, %reason, "delete status refused");
                return Err(LockError::DeletionConflict { invid, reason }.into());
            }
        }
        if let Some(deleter) = registry.foreign_deleter(invid, session) {
            return Err(LockError::DeletionConflict {
                invid,
                reason: format!("already being deleted by {deleter}"),
            }
            .into());
        }

        registry.deleting.insert(invid, session);
        drop(registry);
        object.mark_deleting(session);
        Ok(())
    }

    /// Withdraws the deletion mark `session` placed on `invid`.
    pub fn clear_delete_status(&self, invid: Invid, session: OwnerKey) -> bool {
        let mut registry = self.registry.lock();
        if registry.deleting.get(&invid) == Some(&session) {
            registry.deleting.remove(&invid);
            true
        } else {
            false
        }
    }

    /// Drops every protection and deletion mark held by `session`.
    /// Called at commit and abort.
    pub fn release_session(&self, session: OwnerKey) {
        let mut registry = self.registry.lock();
        let invids: Vec<Invid> = registry
            .by_session
            .get(&session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for invid in &invids {
            registry.unprotect(session, *invid);
        }
        registry.deleting.retain(|_, deleter| *deleter != session);
        if !invids.is_empty() {
            tracing::debug!(%session, released = invids.len(), "released deletion locks");
        }
    }

    /// Protects a batch of records for `session`, or none of them.
    pub fn add_session_invids<I>(&self, session: OwnerKey, invids: I) -> Result<()>
    where
        I: IntoIterator<Item = Invid>,
    {
        let invids: Vec<Invid> = invids.into_iter().collect();
        let mut registry = self.registry.lock();

        for invid in &invids {
            if let Some(deleter) = registry.foreign_deleter(*invid, session) {
                tracing::debug!(invid = %invid, %session, %deleter, "batch deletion lock refused");
                return Err(LockError::DeletionConflict {
                    invid: *invid,
                    reason: format!("being deleted by {deleter}"),
                }
                .into());
            }
        }
        for invid in invids {
            registry.protect(session, invid);
        }
        Ok(())
    }

    pub fn session_checkpoint(&self, session: OwnerKey) -> DeletionCheckpoint {
        let registry = self.registry.lock();
        DeletionCheckpoint {
            session,
            protected: registry
                .by_session
                .get(&session)
                .cloned()
                .unwrap_or_default(),
            deleting: registry
                .deleting
                .iter()
                .filter(|(_, deleter)| **deleter == session)
                .map(|(invid, _)| *invid)
                .collect(),
        }
    }

    /// Rolls `session` back to `checkpoint`, removing protections added
    /// since. The checkpoint must be a subset of the current protections.
    pub fn revert_session_checkpoint(
        &self,
        session: OwnerKey,
        checkpoint: &DeletionCheckpoint,
    ) -> Result<()> {
        ensure!(
            checkpoint.session == session,
            "checkpoint of {} cannot be applied to {session}",
            checkpoint.session
        );

        let mut registry = self.registry.lock();
        let current = registry
            .by_session
            .get(&session)
            .cloned()
            .unwrap_or_default();

        let extra = checkpoint.protected.difference(&current).count();
        if extra > 0 {
            tracing::error!(%session, extra, "checkpoint revert would add protections");
            return Err(LockError::CheckpointMismatch { session, extra }.into());
        }

        let added: Vec<Invid> = current.difference(&checkpoint.protected).copied().collect();
        for invid in &added {
            registry.unprotect(session, *invid);
        }
        registry
            .deleting
            .retain(|invid, deleter| *deleter != session || checkpoint.deleting.contains(invid));
        tracing::debug!(%session, removed = added.len(), "reverted deletion checkpoint");
        Ok(())
    }

    /// Sessions protecting `invid`, in key order.
    pub fn protectors(&self, invid: Invid) -> Vec<OwnerKey> {
        let registry = self.registry.lock();
        let mut sessions: Vec<OwnerKey> = registry
            .by_invid
            .get(&invid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        sessions.sort();
        sessions
    }

    /// Records protected by `session`, in identifier order.
    pub fn protected_by(&self, session: OwnerKey) -> Vec<Invid> {
        let registry = self.registry.lock();
        let mut invids: Vec<Invid> = registry
            .by_session
            .get(&session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        invids.sort();
        invids
    }

    pub fn is_delete_locked(&self, invid: Invid) -> bool {
        self.registry.lock().by_invid.contains_key(&invid)
    }

    pub fn deleting_session(&self, invid: Invid) -> Option<OwnerKey> {
        self.registry.lock().deleting.get(&invid).copied()
    }

    /// Verifies that the two registries mirror each other exactly.
    pub fn check_invariants(&self) -> Result<()> {
        let registry = self.registry.lock();
        for (session, invids) in &registry.by_session {
            ensure!(!invids.is_empty(), "{session} has an empty protection set");
            for invid in invids {
                ensure!(
                    registry
                        .by_invid
                        .get(invid)
                        .is_some_and(|sessions| sessions.contains(session)),
                    "{session} protects {invid} but is not listed as its protector"
                );
            }
        }
        for (invid, sessions) in &registry.by_invid {
            ensure!(!sessions.is_empty(), "{invid} has an empty protector set");
            for session in sessions {
                ensure!(
                    registry
                        .by_session
                        .get(session)
                        .is_some_and(|invids| invids.contains(invid)),
                    "{invid} lists {session} as protector but the session does not protect it"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::lock_error;
    use parking_lot::Mutex as PlMutex;

    struct Record {
        invid: Invid,
        deleting: PlMutex<Option<OwnerKey>>,
    }

    impl Record {
        fn new(num: u32) -> Self {
            Self {
                invid: Invid::new(1, num),
                deleting: PlMutex::new(None),
            }
        }

        fn deleting_session(&self) -> Option<OwnerKey> {
            *self.deleting.lock()
        }
    }

    impl DeletionTarget for Record {
        fn invid(&self) -> Invid {
            self.invid
        }

        fn mark_deleting(&self, session: OwnerKey) {
            *self.deleting.lock() = Some(session);
        }
    }

    const A: OwnerKey = OwnerKey(1);
    const B: OwnerKey = OwnerKey(2);

    fn is_conflict(report: &eyre::Report) -> bool {
        lock_error(report).is_some_and(LockError::is_deletion_conflict)
    }

    #[test]
    fn protection_is_mirrored() {
        let mgr = DeletionManager::new();
        let rec = Record::new(10);
        mgr.delete_lock_object(&rec, A).unwrap();
        mgr.delete_lock_object(&rec, B).unwrap();
        assert_eq!(mgr.protectors(rec.invid), vec![A, B]);
        assert_eq!(mgr.protected_by(A), vec![rec.invid]);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn cannot_protect_what_another_session_deletes() {
        let mgr = DeletionManager::new();
        let rec = Record::new(10);
        mgr.set_delete_status(&rec, B).unwrap();
        assert_eq!(rec.deleting_session(), Some(B));

        assert!(is_conflict(&mgr.delete_lock_object(&rec, A).unwrap_err()));
        mgr.delete_lock_object(&rec, B).unwrap();
        assert_eq!(mgr.protectors(rec.invid), vec![B]);
    }

    #[test]
    fn delete_status_requires_sole_or_no_protector() {
        let mgr = DeletionManager::new();
        let rec = Record::new(10);

        mgr.delete_lock_object(&rec, A).unwrap();
        assert!(is_conflict(&mgr.set_delete_status(&rec, B).unwrap_err()));

        mgr.delete_lock_object(&rec, B).unwrap();
        assert!(is_conflict(&mgr.set_delete_status(&rec, A).unwrap_err()));
        assert!(rec.deleting_session().is_none());

        mgr.release_session(B);
        mgr.set_delete_status(&rec, A).unwrap();
        assert_eq!(mgr.deleting_session(rec.invid), Some(A));
    }

    #[test]
    fn release_session_clears_both_sides() {
        let mgr = DeletionManager::new();
        mgr.add_session_invids(A, [Invid::new(1, 1), Invid::new(1, 2)]).unwrap();
        mgr.add_session_invids(B, [Invid::new(1, 2)]).unwrap();

        mgr.release_session(A);
        assert!(mgr.protected_by(A).is_empty());
        assert!(!mgr.is_delete_locked(Invid::new(1, 1)));
        assert_eq!(mgr.protectors(Invid::new(1, 2)), vec![B]);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn checkpoint_revert_is_subtractive() {
        let mgr = DeletionManager::new();
        mgr.add_session_invids(A, [Invid::new(1, 1)]).unwrap();
        let checkpoint = mgr.session_checkpoint(A);
        assert_eq!(checkpoint.len(), 1);

        mgr.add_session_invids(A, [Invid::new(1, 2), Invid::new(1, 3)]).unwrap();
        mgr.revert_session_checkpoint(A, &checkpoint).unwrap();
        assert_eq!(mgr.protected_by(A), vec![Invid::new(1, 1)]);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn checkpoint_revert_rejects_supersets() {
        let mgr = DeletionManager::new();
        mgr.add_session_invids(A, [Invid::new(1, 1), Invid::new(1, 2)]).unwrap();
        let checkpoint = mgr.session_checkpoint(A);
        mgr.release_session(A);
        mgr.add_session_invids(A, [Invid::new(1, 1)]).unwrap();

        let report = mgr.revert_session_checkpoint(A, &checkpoint).unwrap_err();
        assert!(matches!(
            lock_error(&report),
            Some(LockError::CheckpointMismatch { extra: 1, .. })
        ));
        assert_eq!(mgr.protected_by(A), vec![Invid::new(1, 1)]);
    }

    #[test]
    fn checkpoint_revert_drops_new_deletion_marks() {
        let mgr = DeletionManager::new();
        let checkpoint = mgr.session_checkpoint(A);
        let rec = Record::new(4);
        mgr.set_delete_status(&rec, A).unwrap();
        mgr.revert_session_checkpoint(A, &checkpoint).unwrap();
        assert!(mgr.deleting_session(rec.invid).is_none());
    }

    #[test]
    fn checkpoint_of_another_session_is_refused() {
        let mgr = DeletionManager::new();
        let checkpoint = mgr.session_checkpoint(A);
        assert!(mgr.revert_session_checkpoint(B, &checkpoint).is_err());
    }

    #[test]
    fn single_and_batch_protection_agree_after_revert() {
        let mgr = DeletionManager::new();
        let rec = Record::new(1);
        let checkpoint = mgr.session_checkpoint(A);
        mgr.set_delete_status(&rec, A).unwrap();
        assert!(is_conflict(&mgr.delete_lock_object(&rec, B).unwrap_err()));
        assert!(is_conflict(
            &mgr.add_session_invids(B, [rec.invid]).unwrap_err()
        ));

        mgr.revert_session_checkpoint(A, &checkpoint).unwrap();
        assert!(mgr.deleting_session(rec.invid).is_none());
        // The record still carries its stale notification; the manager decides.
        assert_eq!(rec.deleting_session(), Some(A));
        mgr.delete_lock_object(&rec, B).unwrap();
        mgr.add_session_invids(B, [rec.invid]).unwrap();
        assert_eq!(mgr.protectors(rec.invid), vec![B]);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn target_may_call_back_into_the_manager() {
        struct Reentrant<'a> {
            mgr: &'a DeletionManager,
            seen: PlMutex<Option<OwnerKey>>,
        }

        impl DeletionTarget for Reentrant<'_> {
            fn invid(&self) -> Invid {
                Invid::new(2, 9)
            }

            fn mark_deleting(&self, _session: OwnerKey) {
                *self.seen.lock() = self.mgr.deleting_session(Invid::new(2, 9));
            }
        }

        let mgr = DeletionManager::new();
        let target = Reentrant {
            mgr: &mgr,
            seen: PlMutex::new(None),
        };
        mgr.delete_lock_object(&target, A).unwrap();
        mgr.set_delete_status(&target, A).unwrap();
        assert_eq!(*target.seen.lock(), Some(A));
    }

    #[test]
    fn clear_delete_status_only_for_the_deleter() {
        let mgr = DeletionManager::new();
        let rec = Record::new(4);
        mgr.set_delete_status(&rec, A).unwrap();
        assert!(!mgr.clear_delete_status(rec.invid, B));
        assert!(mgr.clear_delete_status(rec.invid, A));
        assert!(mgr.deleting_session(rec.invid).is_none());
    }
}
