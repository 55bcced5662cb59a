//! Pending tasks: closures queued on a message loop together with their
//! scheduling metadata.
//!
//! A [`PendingTask`] travels by value through exactly one queue at a time:
//! the thread-safe incoming queue, then either the loop's work queue, its
//! delayed-task heap, or its deferred non-nestable queue.
//!
//! # Ordering
//!
//! Delayed tasks are ordered by run time, then by sequence number. The
//! sequence number is assigned when the task enters the incoming queue, so
//! two tasks due at the same instant run in the order they were posted.

use crate::time::TimeTicks;

use std::cmp::Ordering;
use std::fmt;
use std::panic::Location;

/// Boxed closure run by a message loop.
pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work queued on a message loop.
pub struct PendingTask {
    task: Closure,
    posted_from: &'static Location<'static>,
    pub(crate) sequence_num: u64,
    time_posted: TimeTicks,
    delayed_run_time: TimeTicks,
    nestable: bool,
}

impl PendingTask {
    /// Wraps `task` with its scheduling metadata.
    ///
    /// The sequence number is filled in by the incoming queue.
    pub(crate) fn new(
        posted_from: &'static Location<'static>,
        task: Closure,
        delayed_run_time: TimeTicks,
        nestable: bool,
    ) -> Self {
        Self {
            task,
            posted_from,
            sequence_num: 0,
            time_posted: TimeTicks::now(),
            delayed_run_time,
            nestable,
        }
    }

    /// Source location of the posting call.
    pub fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    /// Position of this task in its loop's intake order.
    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    /// When the task was posted.
    pub fn time_posted(&self) -> TimeTicks {
        self.time_posted
    }

    /// Earliest time the task may run; null for immediate tasks.
    pub fn delayed_run_time(&self) -> TimeTicks {
        self.delayed_run_time
    }

    /// Whether the task may run inside a nested run loop.
    pub fn nestable(&self) -> bool {
        self.nestable
    }

    /// Consumes the task and runs its closure.
    pub(crate) fn run(self) {
        log::trace!(
            "running task #{} posted from {}",
            self.sequence_num,
            self.posted_from
        );
        (self.task)();
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("sequence_num", &self.sequence_num)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("nestable", &self.nestable)
            .finish()
    }
}

/// Heap entry ordering delayed tasks so that `BinaryHeap` pops the earliest
/// run time first, and the lowest sequence number among equal run times.
pub(crate) struct DelayedTask(pub(crate) PendingTask);

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .0
            .delayed_run_time
            .cmp(&self.0.delayed_run_time)
            .then_with(|| other.0.sequence_num.cmp(&self.0.sequence_num))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BinaryHeap;
    use std::time::Duration;

    #[track_caller]
    fn delayed(run_time: TimeTicks, sequence_num: u64) -> DelayedTask {
        let mut task = PendingTask::new(Location::caller(), Box::new(|| {}), run_time, true);
        task.sequence_num = sequence_num;
        DelayedTask(task)
    }

    #[test]
    fn heap_pops_earliest_then_lowest_sequence() {
        let base = TimeTicks::now();
        let later = base + Duration::from_millis(10);

        let mut heap = BinaryHeap::new();
        heap.push(delayed(later, 1));
        heap.push(delayed(base, 3));
        heap.push(delayed(base, 2));
        heap.push(delayed(later, 0));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.0.sequence_num)).collect();
        assert_eq!(order, vec![2, 3, 0, 1]);
    }

    #[test]
    fn records_posting_location() {
        let task = delayed(TimeTicks::null(), 0).0;
        assert!(task.posted_from().file().ends_with("task.rs"));
        assert!(task.nestable());
    }
}
