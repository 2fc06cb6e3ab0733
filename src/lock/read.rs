//! # ReadLock
//!
//! Shared access. A read lock may become active on a partition when no
//! writer is active there and no writer is queued there. Dumpers never
//! hold it back.
//!
//! The queued-writer rule is what keeps a steady stream of readers from
//! starving a writer: once a writer has entered its second stage, new
//! readers wait behind it. The one exception is an owner that already holds
//! another active read lock, on any partition. It is not held back by a
//! queued writer, since that writer may itself be waiting for the owner's
//! existing read lock to go away.

use super::sync::{remove_id, PartitionQueues};
use super::{LockId, LockProtocol, StageView};

pub(crate) struct ReadLock;

impl LockProtocol for ReadLock {
    fn ready(&self, _stage: u8, view: &StageView<'_>) -> bool {
        let queues = view.queues;
        queues.writer.is_none() && (queues.waiting_writers.is_empty() || view.owner_holds_reads)
    }

    fn advance(&self, _stage: u8, id: LockId, queues: &mut PartitionQueues) {
        queues.readers.push(id);
    }

    fn release(&self, id: LockId, queues: &mut PartitionQueues) -> bool {
        remove_id(&mut queues.readers, id)
    }
}
