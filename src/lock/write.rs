//! # WriteLock
//!
//! Exclusive access, acquired in two stages:
//!
//! ```text
//! stage 0: wait until no target has an active or queued dumper
//!          then join every target's waiting-writer list
//!          (new readers now wait behind us; active ones are unaffected)
//! stage 1: wait until every target is free of readers, dumpers and writers
//!          then leave the waiting list and become the active writer everywhere
//! ```
//!
//! Both stages re-check the server operations gate on every wakeup and fail
//! with its status unless it is the graceful-shutdown notice.
//!
//! A dumper that queues after this writer has reached stage 1 is not made to
//! wait for it; the writer simply waits for that dumper to finish as well.

use super::sync::{remove_id, PartitionQueues};
use super::{LockId, LockProtocol, StageView};

pub(crate) struct WriteLock;

const DEFER_TO_DUMPERS: u8 = 0;
const DRAIN: u8 = 1;

impl LockProtocol for WriteLock {
    fn stages(&self) -> u8 {
        2
    }

    fn ready(&self, stage: u8, view: &StageView<'_>) -> bool {
        let queues = view.queues;
        match stage {
            DEFER_TO_DUMPERS => queues.dumpers.is_empty() && queues.waiting_dumpers.is_empty(),
            DRAIN => {
                queues.writer.is_none() && queues.readers.is_empty() && queues.dumpers.is_empty()
            }
            _ => false,
        }
    }

    fn advance(&self, stage: u8, id: LockId, queues: &mut PartitionQueues) {
        match stage {
            DEFER_TO_DUMPERS => queues.waiting_writers.push(id),
            _ => {
                remove_id(&mut queues.waiting_writers, id);
                queues.writer = Some(id);
            }
        }
    }

    fn withdraw(&self, id: LockId, queues: &mut PartitionQueues) {
        remove_id(&mut queues.waiting_writers, id);
    }

    fn release(&self, id: LockId, queues: &mut PartitionQueues) -> bool {
        if queues.writer == Some(id) {
            queues.writer = None;
            true
        } else {
            false
        }
    }

    fn consults_gate(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(stage: u8, queues: &PartitionQueues) -> bool {
        WriteLock.ready(
            stage,
            &StageView {
                queues,
                owner_holds_reads: false,
            },
        )
    }

    #[test]
    fn first_stage_defers_to_waiting_and_active_dumpers() {
        let mut queues = PartitionQueues::default();
        queues.waiting_dumpers.push(LockId(1));
        assert!(!ready(DEFER_TO_DUMPERS, &queues));

        queues.waiting_dumpers.clear();
        queues.dumpers.push(LockId(1));
        assert!(!ready(DEFER_TO_DUMPERS, &queues));

        queues.dumpers.clear();
        queues.readers.push(LockId(2));
        assert!(ready(DEFER_TO_DUMPERS, &queues));
    }

    #[test]
    fn second_stage_needs_an_empty_partition() {
        let mut queues = PartitionQueues::default();
        queues.readers.push(LockId(2));
        assert!(!ready(DRAIN, &queues));
        queues.readers.clear();

        queues.writer = Some(LockId(3));
        assert!(!ready(DRAIN, &queues));
        queues.writer = None;

        queues.waiting_writers.push(LockId(4));
        queues.waiting_dumpers.push(LockId(5));
        assert!(ready(DRAIN, &queues));
    }

    #[test]
    fn stages_move_through_waiting_list_to_active_slot() {
        let mut queues = PartitionQueues::default();
        WriteLock.advance(DEFER_TO_DUMPERS, LockId(7), &mut queues);
        assert_eq!(queues.waiting_writers.as_slice(), &[LockId(7)]);

        WriteLock.advance(DRAIN, LockId(7), &mut queues);
        assert!(queues.waiting_writers.is_empty());
        assert_eq!(queues.writer, Some(LockId(7)));

        assert!(!WriteLock.release(LockId(8), &mut queues));
        assert!(WriteLock.release(LockId(7), &mut queues));
        assert!(queues.writer.is_none());
    }
}
