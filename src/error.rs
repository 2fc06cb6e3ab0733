//! # Lock Manager Errors
//!
//! Every public operation returns `eyre::Result`. Failures that callers need
//! to tell apart are raised as a [`LockError`] inside the report, so the
//! session layer can classify them without string matching:
//!
//! ```ignore
//! match session.open_write_lock(&parts) {
//!     Ok(lock) => { /* ... */ }
//!     Err(report) if lock_error(&report).is_some_and(LockError::is_interrupted) => {
//!         // treat the lock as never acquired
//!     }
//!     Err(report) => return Err(report),
//! }
//! ```
//!
//! ## Taxonomy
//!
//! | Variant              | Raised by                          | Blocking? |
//! |----------------------|------------------------------------|-----------|
//! | `SelfConflict`       | session pre-check, key claim       | never     |
//! | `Interrupted`        | `abort()` during `establish()`     | unwinds   |
//! | `OperationsDisabled` | write establish, gate closed       | unwinds   |
//! | `Invariant`          | bookkeeping mismatch in `LockSync` | never     |
//! | `DeletionConflict`   | `DeletionManager`                  | never     |
//! | `CheckpointMismatch` | checkpoint revert                  | never     |
//! | `InvalidState`       | misuse of a lock handle            | never     |

use crate::deletion::Invid;
use crate::lock::{LockId, OwnerKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The owner already holds a lock the request would conflict with.
    #[error("owner {key} cannot acquire {requested}: {reason}")]
    SelfConflict {
        key: OwnerKey,
        requested: &'static str,
        reason: String,
    },

    /// `abort()` was called while the lock was still being established.
    #[error("establishment of lock {lock} was interrupted")]
    Interrupted { lock: LockId },

    /// The server has disabled operations (schema edit, forced shutdown).
    #[error("operations disabled: {0}")]
    OperationsDisabled(String),

    /// Internal bookkeeping no longer matches reality.
    #[error("lock invariant violated: {0}")]
    Invariant(String),

    /// Another session stands in the way of protecting or deleting a record.
    #[error("deletion conflict on {invid}: {reason}")]
    DeletionConflict { invid: Invid, reason: String },

    /// A checkpoint revert was asked to add protections back.
    #[error("checkpoint for session {session} is not a subset of its protections ({extra} unknown)")]
    CheckpointMismatch { session: OwnerKey, extra: usize },

    /// The lock handle is not in a state that permits the operation.
    #[error("lock {lock} is {state}; cannot {operation}")]
    InvalidState {
        lock: LockId,
        state: &'static str,
        operation: &'static str,
    },
}

impl LockError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    pub fn is_self_conflict(&self) -> bool {
        matches!(self, Self::SelfConflict { .. })
    }

    pub fn is_operations_disabled(&self) -> bool {
        matches!(self, Self::OperationsDisabled(_))
    }

    pub fn is_deletion_conflict(&self) -> bool {
        matches!(self, Self::DeletionConflict { .. })
    }
}

/// Extracts the [`LockError`] carried by a report, if any.
pub fn lock_error(report: &eyre::Report) -> Option<&LockError> {
    report.downcast_ref::<LockError>()
}
