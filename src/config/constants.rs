//! # baselock Configuration Constants
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_RECHECK_INTERVAL (2500 ms)
//!       │
//!       └─> MIN_RECHECK_INTERVAL (must be <=)
//!             Every blocked establish() wakes at least this often to
//!             re-evaluate its predicate, even without a notification.
//!
//! READER_INLINE_CAPACITY (8)
//!       │
//!       └─> QUEUE_INLINE_CAPACITY (4, writers/dumpers are rarer than readers)
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MIN_RECHECK_INTERVAL <= DEFAULT_RECHECK_INTERVAL`
//! 2. `QUEUE_INLINE_CAPACITY <= READER_INLINE_CAPACITY`

use std::time::Duration;

// ============================================================================
// WAIT / WAKE CONFIGURATION
// ============================================================================

/// Upper bound on a single blocking wait inside the lock monitor.
///
/// Waiters are woken by a broadcast on every state change; this timeout is
/// the fallback that keeps them live if a wakeup is ever missed.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(2500);

/// Smallest recheck interval the builder accepts.
pub const MIN_RECHECK_INTERVAL: Duration = Duration::from_millis(1);

const _: () = assert!(
    MIN_RECHECK_INTERVAL.as_millis() <= DEFAULT_RECHECK_INTERVAL.as_millis(),
    "MIN_RECHECK_INTERVAL must not exceed DEFAULT_RECHECK_INTERVAL"
);

// ============================================================================
// SERVER LIFECYCLE
// ============================================================================

/// Status string published by the operations gate during a graceful
/// shutdown. Write locks keep waiting when they see it; any other disabled
/// status aborts their establishment.
pub const SHUTDOWN_NOTICE: &str = "shutdown";

// ============================================================================
// INLINE CAPACITIES
// Sized so that the common case never spills to the heap.
// ============================================================================

/// Inline slots for active readers per partition.
pub const READER_INLINE_CAPACITY: usize = 8;

/// Inline slots for writer and dumper queues per partition.
pub const QUEUE_INLINE_CAPACITY: usize = 4;

/// Inline slots for concurrent read locks held under one owner key.
pub const OWNER_READS_INLINE_CAPACITY: usize = 4;

const _: () = assert!(
    QUEUE_INLINE_CAPACITY <= READER_INLINE_CAPACITY,
    "writer/dumper queues should not be sized above the reader set"
);
