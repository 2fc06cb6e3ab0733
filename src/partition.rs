//! # Partitions
//!
//! A partition (a "base") is a named collection of records sharing one
//! schema, and the unit of lock granularity. This module only models the
//! identity of a partition; its lock queues live inside the
//! [`LockSync`](crate::lock::LockSync) monitor so that they can never be
//! read or written without holding it.
//!
//! ## Ordering
//!
//! Partitions order by name, then by id. Locks sort and deduplicate their
//! target set with this ordering at construction, which gives every
//! conflict check and every queue mutation a deterministic iteration order.
//!
//! ## Registry
//!
//! ```text
//! PartitionRegistry
//!   next_id: AtomicU32
//!   by_name: RwLock<BTreeMap<name, Partition>>   (name-ordered)
//! ```
//!
//! `register` is idempotent: registering an existing name returns the
//! partition already known under it.

use parking_lot::RwLock;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition#{}", self.0)
    }
}

/// Cheap, cloneable handle to a registered partition.
#[derive(Clone)]
pub struct Partition {
    id: PartitionId,
    name: Arc<str>,
}

impl Partition {
    pub(crate) fn new(id: PartitionId, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Partition {}

impl std::hash::Hash for Partition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Partition {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Partition {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id.0)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Sorts by name and drops duplicates.
pub(crate) fn normalize(partitions: &[Partition]) -> Arc<[Partition]> {
    let mut sorted = partitions.to_vec();
    sorted.sort();
    sorted.dedup();
    Arc::from(sorted)
}

/// Name-ordered catalog of every partition known to a lock manager.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    next_id: AtomicU32,
    by_name: RwLock<BTreeMap<Arc<str>, Partition>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the partition registered under `name`, creating it if needed.
    pub fn register(&self, name: &str) -> Partition {
        if let Some(existing) = self.by_name.read().get(name) {
            return existing.clone();
        }

        let mut map = self.by_name.write();
        // Double-check under the write lock, another thread may have won.
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        let id = PartitionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let partition = Partition::new(id, name);
        map.insert(Arc::clone(&partition.name), partition.clone());
        tracing::debug!(partition = %name, id = id.0, "registered partition");
        partition
    }

    pub fn get(&self, name: &str) -> Option<Partition> {
        self.by_name.read().get(name).cloned()
    }

    /// Every registered partition, in name order.
    pub fn all(&self) -> Vec<Partition> {
        self.by_name.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
