//! # Operations Gate
//!
//! The server publishes a single status string telling lock establishment
//! whether new exclusive work may start:
//!
//! | Status         | Meaning                        | Write establish |
//! |----------------|--------------------------------|-----------------|
//! | `None`         | operations enabled             | proceeds        |
//! | `"shutdown"`   | graceful shutdown in progress  | keeps waiting   |
//! | anything else  | schema edit, forced shutdown   | fails with it   |
//!
//! Read and dump locks never consult the gate.

use crate::config::SHUTDOWN_NOTICE;
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct OperationsGate {
    status: RwLock<Option<String>>,
}

impl OperationsGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status; `None` when operations are enabled.
    pub fn check_enabled(&self) -> Option<String> {
        self.status.read().clone()
    }

    /// The message a write establish must fail with, if any.
    pub(crate) fn rejection(&self) -> Option<String> {
        self.status
            .read()
            .as_deref()
            .filter(|status| *status != SHUTDOWN_NOTICE)
            .map(str::to_owned)
    }

    pub(crate) fn set(&self, status: Option<String>) {
        *self.status.write() = status;
    }
}
