//! Cross-thread handle to a message loop.

use crate::reactor::PumpKind;
use crate::runtime::{IncomingTaskQueue, MessageLoop};
use crate::task::{Closure, PendingTask};
use crate::time::TimeTicks;

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// State of a loop that other threads may touch.
pub(crate) struct LoopShared {
    pub(crate) incoming: IncomingTaskQueue,
    pub(crate) run_depth: AtomicUsize,
    pub(crate) kind: PumpKind,
    pub(crate) thread_id: ThreadId,
}

/// `Send + Sync` task runner for one message loop.
///
/// Handles are cheap to clone and may outlive their loop; posting to a
/// destroyed loop returns `false` and drops the task.
///
/// # Example
///
/// ```ignore
/// let handle = message_loop.handle();
/// std::thread::spawn(move || {
///     handle.post_task(|| log::info!("ran on the loop thread"));
/// });
/// ```
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub(crate) fn new(shared: Arc<LoopShared>) -> Self {
        Self { shared }
    }

    /// Posts `task` to run as soon as possible.
    #[track_caller]
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.post_at(Location::caller(), Box::new(task), Duration::ZERO, true)
    }

    /// Posts `task` to run no sooner than `delay` from now.
    #[track_caller]
    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        self.post_at(Location::caller(), Box::new(task), delay, true)
    }

    /// Posts `task` so that it only runs at the outermost run depth.
    #[track_caller]
    pub fn post_non_nestable_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.post_at(Location::caller(), Box::new(task), Duration::ZERO, false)
    }

    /// Non-nestable variant of [`post_delayed_task`](Self::post_delayed_task).
    #[track_caller]
    pub fn post_non_nestable_delayed_task(
        &self,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> bool {
        self.post_at(Location::caller(), Box::new(task), delay, false)
    }

    /// Runs `task` on this loop, then `reply` back on the calling thread's
    /// loop once `task` has returned.
    ///
    /// The caller must be running on a message loop. Returns `false` without
    /// posting anything when it is not.
    #[track_caller]
    pub fn post_task_and_reply(
        &self,
        task: impl FnOnce() + Send + 'static,
        reply: impl FnOnce() + Send + 'static,
    ) -> bool {
        let posted_from = Location::caller();

        let Some(origin) = MessageLoop::current().map(|current| current.handle()) else {
            debug_assert!(false, "post_task_and_reply called off a message loop");
            log::error!("post_task_and_reply from {posted_from} has no loop to reply to");
            return false;
        };

        let relay = move || {
            task();
            origin.post_at(posted_from, Box::new(reply), Duration::ZERO, true);
        };

        self.post_at(posted_from, Box::new(relay), Duration::ZERO, true)
    }

    /// Drops `object` on this loop once it is back at the outermost depth.
    #[track_caller]
    pub fn delete_soon<T: Send + 'static>(&self, object: Box<T>) -> bool {
        self.post_at(Location::caller(), Box::new(move || drop(object)), Duration::ZERO, false)
    }

    /// Releases this reference on the loop once it is back at the outermost
    /// depth.
    #[track_caller]
    pub fn release_soon<T: Send + Sync + 'static>(&self, object: Arc<T>) -> bool {
        self.post_at(Location::caller(), Box::new(move || drop(object)), Duration::ZERO, false)
    }

    /// Asks the loop to quit its current run loop once it runs out of work.
    #[track_caller]
    pub fn quit_when_idle(&self) -> bool {
        let quit = || {
            if let Some(current) = MessageLoop::current() {
                current.quit_when_idle();
            }
        };
        self.post_at(Location::caller(), Box::new(quit), Duration::ZERO, true)
    }

    pub(crate) fn post_at(
        &self,
        posted_from: &'static Location<'static>,
        task: Closure,
        delay: Duration,
        nestable: bool,
    ) -> bool {
        let delayed_run_time = TimeTicks::from_delay(delay);
        let pending = PendingTask::new(posted_from, task, delayed_run_time, nestable);

        self.shared.incoming.add_to_incoming_queue(pending)
    }

    /// Current run depth of the loop; zero while it is not running.
    pub fn run_depth(&self) -> usize {
        self.shared.run_depth.load(Ordering::Acquire)
    }

    /// Whether the loop is running inside a nested run loop.
    pub fn is_nested(&self) -> bool {
        self.run_depth() > 1
    }

    pub fn belongs_to_current_thread(&self) -> bool {
        self.shared.thread_id == thread::current().id()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub fn pump_kind(&self) -> PumpKind {
        self.shared.kind
    }

    /// Whether the loop still accepts tasks.
    pub fn is_alive(&self) -> bool {
        self.shared.incoming.is_accepting()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .field("kind", &self.shared.kind)
            .field("run_depth", &self.run_depth())
            .finish()
    }
}
