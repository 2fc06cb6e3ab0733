//! # Deletion Lock Tests
//!
//! Verifies the `DeletionManager` bookkeeping that keeps records from being
//! deleted while other sessions still reference them.
//!
//! ## Test Goals
//!
//! 1. **Symmetry**: `S` protects `I` exactly when `I` lists `S` as protector
//! 2. **Subtractive Rollback**: a checkpoint revert never adds protections
//! 3. **Batch Atomicity**: a batch with one conflicting record protects nothing
//! 4. **Delete Gate**: only a sole (or absent) protector may start a deletion
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test deletion_locks
//! ```

use baselock::{lock_error, DeletionTarget, Invid, LockError, LockManager, OwnerKey};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

struct Record {
    invid: Invid,
    deleting: Mutex<Option<OwnerKey>>,
}

impl Record {
    fn new(num: u32) -> Self {
        Self {
            invid: Invid::new(3, num),
            deleting: Mutex::new(None),
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

fn is_conflict(report: &eyre::Report) -> bool {
    lock_error(report).is_some_and(LockError::is_deletion_conflict)
}

#[test]
fn batch_with_a_record_being_deleted_protects_nothing() {
    let m = LockManager::new();
    let deletion = m.deletion();
    let a = m.open_session();
    let b = m.open_session();
    let x = Record::new(1);
    let y = Record::new(2);

    deletion.set_delete_status(&y, b.key()).unwrap();

    let report = deletion
        .add_session_invids(a.key(), [x.invid, y.invid])
        .unwrap_err();
    assert!(is_conflict(&report));
    assert!(!deletion.is_delete_locked(x.invid));
    assert!(deletion.protected_by(a.key()).is_empty());
    deletion.check_invariants().unwrap();
}

#[test]
fn shared_protection_blocks_deletion_until_one_session_ends() {
    let m = LockManager::new();
    let deletion = m.deletion();
    let a = m.open_session();
    let b = m.open_session();
    let rec = Record::new(9);

    deletion.delete_lock_object(&rec, a.key()).unwrap();
    deletion.delete_lock_object(&rec, b.key()).unwrap();
    assert!(is_conflict(&deletion.set_delete_status(&rec, a.key()).unwrap_err()));
    assert!(is_conflict(&deletion.set_delete_status(&rec, b.key()).unwrap_err()));

    m.end_session(&b).unwrap();
    deletion.set_delete_status(&rec, a.key()).unwrap();
    assert_eq!(rec.deleting_session(), Some(a.key()));

    // Now that A is deleting it, B cannot take a new reference.
    assert!(is_conflict(&deletion.delete_lock_object(&rec, b.key()).unwrap_err()));
}

#[test]
fn rollback_only_removes_what_was_added_since_the_checkpoint() {
    let m = LockManager::new();
    let deletion = m.deletion();
    let s = m.open_session();
    let other = m.open_session();
    let base = [Invid::new(3, 1), Invid::new(3, 2)];

    deletion.add_session_invids(s.key(), base).unwrap();
    deletion.add_session_invids(other.key(), [Invid::new(3, 5)]).unwrap();
    let checkpoint = deletion.session_checkpoint(s.key());

    deletion
        .add_session_invids(s.key(), [Invid::new(3, 5), Invid::new(3, 6)])
        .unwrap();
    deletion.revert_session_checkpoint(s.key(), &checkpoint).unwrap();

    assert_eq!(deletion.protected_by(s.key()), base.to_vec());
    assert_eq!(deletion.protectors(Invid::new(3, 5)), vec![other.key()]);
    assert!(!deletion.is_delete_locked(Invid::new(3, 6)));
    deletion.check_invariants().unwrap();
}

#[test]
fn reverted_deletion_no_longer_blocks_single_or_batch_protection() {
    let m = LockManager::new();
    let deletion = m.deletion();
    let a = m.open_session();
    let b = m.open_session();
    let rec = Record::new(1);

    let checkpoint = deletion.session_checkpoint(a.key());
    deletion.set_delete_status(&rec, a.key()).unwrap();
    deletion.revert_session_checkpoint(a.key(), &checkpoint).unwrap();
    assert!(deletion.deleting_session(rec.invid).is_none());

    deletion.delete_lock_object(&rec, b.key()).unwrap();
    let other = Record::new(2);
    deletion.set_delete_status(&other, a.key()).unwrap();
    deletion.clear_delete_status(other.invid, a.key());
    deletion.delete_lock_object(&other, b.key()).unwrap();
    deletion
        .add_session_invids(b.key(), [rec.invid, other.invid])
        .unwrap();
    assert_eq!(deletion.protected_by(b.key()), vec![rec.invid, other.invid]);
    deletion.check_invariants().unwrap();
}

#[test]
fn rollback_to_a_non_subset_fails_and_changes_nothing() {
    let m = LockManager::new();
    let deletion = m.deletion();
    let s = m.open_session();

    deletion
        .add_session_invids(s.key(), [Invid::new(3, 1), Invid::new(3, 2)])
        .unwrap();
    let checkpoint = deletion.session_checkpoint(s.key());
    deletion.release_session(s.key());
    deletion.add_session_invids(s.key(), [Invid::new(3, 2), Invid::new(3, 3)]).unwrap();

    let report = deletion
        .revert_session_checkpoint(s.key(), &checkpoint)
        .unwrap_err();
    assert!(matches!(
        lock_error(&report),
        Some(LockError::CheckpointMismatch { extra: 1, .. })
    ));
    assert_eq!(
        deletion.protected_by(s.key()),
        vec![Invid::new(3, 2), Invid::new(3, 3)]
    );
}

#[test]
fn concurrent_sessions_keep_the_registry_symmetric() {
    const THREADS: usize = 6;
    const ROUNDS: u32 = 200;

    let m = LockManager::new();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let m = m.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = m.open_session();
                let deletion = m.deletion();
                barrier.wait();
                for round in 0..ROUNDS {
                    let invid = Invid::new(3, (round * 7 + t as u32) % 23);
                    match round % 5 {
                        0 | 1 => {
                            let _ = deletion.add_session_invids(session.key(), [invid]);
                        }
                        2 => {
                            let checkpoint = deletion.session_checkpoint(session.key());
                            let _ = deletion.add_session_invids(
                                session.key(),
                                [invid, Invid::new(3, invid.num + 1)],
                            );
                            deletion
                                .revert_session_checkpoint(session.key(), &checkpoint)
                                .unwrap();
                        }
                        3 => {
                            let record = Record::new(invid.num);
                            if deletion.set_delete_status(&record, session.key()).is_ok() {
                                deletion.clear_delete_status(invid, session.key());
                            }
                        }
                        _ => deletion.release_session(session.key()),
                    }
                }
                m.end_session(&session).unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let deletion = m.deletion();
    deletion.check_invariants().unwrap();
    for num in 0..24 {
        assert!(!deletion.is_delete_locked(Invid::new(3, num)));
        assert!(deletion.deleting_session(Invid::new(3, num)).is_none());
    }
}
