//! # Lock Manager Builder
//!
//! `LockManagerBuilder` configures a [`LockManager`] before any session is
//! opened.
//!
//! | Option             | Default                    | Description                          |
//! |--------------------|----------------------------|--------------------------------------|
//! | recheck_interval   | `DEFAULT_RECHECK_INTERVAL` | Upper bound on one monitor wait      |
//! | partitions         | none                       | Names registered before first use    |
//!
//! ```ignore
//! let manager = LockManager::builder()
//!     .recheck_interval(Duration::from_millis(250))
//!     .partitions(["users", "groups", "systems"])
//!     .build()?;
//! ```
//!
//! Partitions can also be registered later with
//! [`LockManager::register_partition`].

use std::time::Duration;

use eyre::{ensure, Result};

use super::LockManager;
use crate::config::{DEFAULT_RECHECK_INTERVAL, MIN_RECHECK_INTERVAL};

pub struct LockManagerBuilder {
    recheck_interval: Option<Duration>,
    partitions: Vec<String>,
}

impl Default for LockManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManagerBuilder {
    pub fn new() -> Self {
        Self {
            recheck_interval: None,
            partitions: Vec::new(),
        }
    }

    /// Sets how long a blocked establish may sleep before re-checking its
    /// predicate without a wakeup.
    pub fn recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = Some(interval);
        self
    }

    pub fn partition(mut self, name: impl Into<String>) -> Self {
        self.partitions.push(name.into());
        self
    }

    pub fn partitions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<LockManager> {
        let recheck_interval = self.recheck_interval.unwrap_or(DEFAULT_RECHECK_INTERVAL);
        ensure!(
            recheck_interval >= MIN_RECHECK_INTERVAL,
            "recheck interval {recheck_interval:?} is below the minimum of {MIN_RECHECK_INTERVAL:?}"
        );

        let manager = LockManager::with_interval(recheck_interval);
        for name in &self.partitions {
            ensure!(!name.is_empty(), "partition names must not be empty");
            manager.register_partition(name);
        }
        tracing::debug!(
            ?recheck_interval,
            partitions = self.partitions.len(),
            "lock manager built"
        );
        Ok(manager)
    }
}
