//! # DumpLock
//!
//! A reader with priority over incoming writers, used for bulk export.
//!
//! `establish` first puts the lock on every target's waiting-dumper list
//! without blocking. From that moment any writer still in its first stage
//! sees a queued dumper and yields. The dump lock then waits only for
//! active writers to leave; it becomes active on all targets at once and
//! moves from the waiting list to the active-dumper set.
//!
//! An interrupted establish withdraws the waiting-dumper registration so a
//! cancelled dump never keeps writers parked.

use super::sync::{remove_id, PartitionQueues};
use super::{LockId, LockProtocol, StageView};

pub(crate) struct DumpLock;

impl LockProtocol for DumpLock {
    fn enqueue(&self, id: LockId, queues: &mut PartitionQueues) {
        queues.waiting_dumpers.push(id);
    }

    fn ready(&self, _stage: u8, view: &StageView<'_>) -> bool {
        view.queues.writer.is_none()
    }

    fn advance(&self, _stage: u8, id: LockId, queues: &mut PartitionQueues) {
        remove_id(&mut queues.waiting_dumpers, id);
        queues.dumpers.push(id);
    }

    fn withdraw(&self, id: LockId, queues: &mut PartitionQueues) {
        remove_id(&mut queues.waiting_dumpers, id);
    }

    fn release(&self, id: LockId, queues: &mut PartitionQueues) -> bool {
        remove_id(&mut queues.dumpers, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(queues: &PartitionQueues) -> bool {
        DumpLock.ready(
            0,
            &StageView {
                queues,
                owner_holds_reads: false,
            },
        )
    }

    #[test]
    fn enqueue_then_advance_moves_to_active_set() {
        let mut queues = PartitionQueues::default();
        DumpLock.enqueue(LockId(1), &mut queues);
        assert_eq!(queues.waiting_dumpers.as_slice(), &[LockId(1)]);

        DumpLock.advance(0, LockId(1), &mut queues);
        assert!(queues.waiting_dumpers.is_empty());
        assert_eq!(queues.dumpers.as_slice(), &[LockId(1)]);
    }

    #[test]
    fn only_an_active_writer_blocks() {
        let mut queues = PartitionQueues::default();
        queues.readers.push(LockId(2));
        queues.waiting_writers.push(LockId(3));
        assert!(ready(&queues));

        queues.writer = Some(LockId(4));
        assert!(!ready(&queues));
    }

    #[test]
    fn withdraw_clears_waiting_registration() {
        let mut queues = PartitionQueues::default();
        DumpLock.enqueue(LockId(1), &mut queues);
        DumpLock.withdraw(LockId(1), &mut queues);
        assert!(queues.waiting_dumpers.is_empty());
        assert!(!DumpLock.release(LockId(1), &mut queues));
    }
}
