//! Thread-safe intake queue of a message loop.
//!
//! Any thread may push; only the owning loop drains, and it drains by
//! swapping the whole queue out under a single lock acquisition. The lock is
//! held for O(1) operations only and never across a callback.

use crate::reactor::PumpWaker;
use crate::task::PendingTask;

use parking_lot::Mutex;
use std::collections::VecDeque;

struct IncomingState {
    queue: VecDeque<PendingTask>,
    next_sequence_num: u64,
    accepting: bool,
}

/// The mailbox tasks land in before the owning loop picks them up.
pub(crate) struct IncomingTaskQueue {
    state: Mutex<IncomingState>,
    waker: PumpWaker,
}

impl IncomingTaskQueue {
    pub(crate) fn new(waker: PumpWaker) -> Self {
        Self {
            state: Mutex::new(IncomingState {
                queue: VecDeque::new(),
                next_sequence_num: 0,
                accepting: true,
            }),
            waker,
        }
    }

    /// Assigns the next sequence number to `task` and enqueues it.
    ///
    /// The pump is woken only when the queue was empty before this push: a
    /// non-empty queue means a wakeup is already on its way. Returns `false`
    /// once the owning loop has shut the queue down; the task is dropped.
    pub(crate) fn add_to_incoming_queue(&self, mut task: PendingTask) -> bool {
        let was_empty = {
            let mut state = self.state.lock();
            if !state.accepting {
                drop(state);
                log::debug!(
                    "task posted from {} after its loop was destroyed",
                    task.posted_from()
                );
                return false;
            }

            task.sequence_num = state.next_sequence_num;
            state.next_sequence_num += 1;

            let was_empty = state.queue.is_empty();
            state.queue.push_back(task);
            was_empty
        };

        if was_empty {
            self.waker.schedule_work();
        }

        true
    }

    /// Moves every queued task into `work_queue`, which must be empty.
    pub(crate) fn reload_work_queue(&self, work_queue: &mut VecDeque<PendingTask>) {
        debug_assert!(work_queue.is_empty());

        let mut state = self.state.lock();
        std::mem::swap(&mut state.queue, work_queue);
    }

    /// Stops accepting tasks and discards whatever is still queued.
    pub(crate) fn shut_down(&self) {
        let discarded = {
            let mut state = self.state.lock();
            state.accepting = false;
            std::mem::take(&mut state.queue)
        };

        if !discarded.is_empty() {
            log::debug!("discarding {} unprocessed task(s)", discarded.len());
        }
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }
}
