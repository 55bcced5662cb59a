//! The message loop: a single-threaded cooperative task scheduler.
//!
//! A [`MessageLoop`] owns one pump and four task collections:
//!
//! - the thread-safe incoming queue every post lands in,
//! - the local work queue the incoming queue is swapped into,
//! - the delayed-task heap, ordered by run time then sequence number,
//! - the deferred queue of non-nestable tasks seen while nested.
//!
//! The pump drives the loop through `PumpDelegate`; one task runs per
//! `do_work`/`do_delayed_work`/`do_idle_work` call so the pump can check
//! for a quit request between tasks.
//!
//! # Re-entrancy
//!
//! Tasks may run a nested [`RunLoop`](crate::RunLoop) on the same loop. All
//! methods take `&self` and interior state is only borrowed for the duration
//! of a queue operation, never while a task runs.

use crate::error::LoopError;
use crate::reactor::{IoHandler, IoPump, MessagePump, PumpDelegate, PumpKind, UiPump};
use crate::runtime::handle::LoopShared;
use crate::runtime::run_loop::RunLoopState;
use crate::runtime::{IncomingTaskQueue, LoopHandle, context};
use crate::task::{DelayedTask, PendingTask};
use crate::time::TimeTicks;

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::os::fd::RawFd;
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

type ExtensionSignal = Rc<dyn Fn() -> bool>;

/// A per-thread task scheduler driven by a pump.
pub struct MessageLoop {
    shared: Arc<LoopShared>,
    pump: MessagePump,
    work_queue: RefCell<VecDeque<PendingTask>>,
    delayed_work_queue: RefCell<BinaryHeap<DelayedTask>>,
    deferred_non_nestable_work_queue: RefCell<VecDeque<PendingTask>>,
    recent_time: Cell<TimeTicks>,
    pub(crate) current_run_loop: RefCell<Option<Rc<RunLoopState>>>,
    extension_signal: RefCell<Option<ExtensionSignal>>,
}

impl MessageLoop {
    /// Creates a loop with a `kind` pump and makes it current on this thread.
    ///
    /// # Errors
    /// [`LoopError::AlreadyRegistered`] if this thread already has a loop,
    /// [`LoopError::Io`] if the pump's OS resources cannot be created.
    ///
    /// # Example
    /// ```ignore
    /// let message_loop = MessageLoop::new(PumpKind::Default)?;
    /// message_loop.post_task(|| println!("hello"));
    /// RunLoop::new()?.run_until_idle();
    /// ```
    pub fn new(kind: PumpKind) -> Result<Rc<Self>, LoopError> {
        if context::current().is_some() {
            return Err(LoopError::AlreadyRegistered);
        }

        let pump = MessagePump::new(kind)?;
        let shared = Arc::new(LoopShared {
            incoming: IncomingTaskQueue::new(pump.waker()),
            run_depth: AtomicUsize::new(0),
            kind,
            thread_id: thread::current().id(),
        });

        let message_loop = Rc::new(Self {
            shared,
            pump,
            work_queue: RefCell::new(VecDeque::new()),
            delayed_work_queue: RefCell::new(BinaryHeap::new()),
            deferred_non_nestable_work_queue: RefCell::new(VecDeque::new()),
            recent_time: Cell::new(TimeTicks::null()),
            current_run_loop: RefCell::new(None),
            extension_signal: RefCell::new(None),
        });

        context::register(&message_loop)?;
        log::debug!(
            "created {} message loop on {:?}",
            kind,
            thread::current().name().unwrap_or("<unnamed>")
        );

        Ok(message_loop)
    }

    /// The loop registered on the calling thread.
    pub fn current() -> Option<Rc<MessageLoop>> {
        context::current()
    }

    /// A `Send` handle for posting to this loop from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.shared.clone())
    }

    pub fn pump_kind(&self) -> PumpKind {
        self.shared.kind
    }

    #[track_caller]
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.handle()
            .post_at(Location::caller(), Box::new(task), Duration::ZERO, true)
    }

    #[track_caller]
    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        self.handle()
            .post_at(Location::caller(), Box::new(task), delay, true)
    }

    #[track_caller]
    pub fn post_non_nestable_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.handle()
            .post_at(Location::caller(), Box::new(task), Duration::ZERO, false)
    }

    #[track_caller]
    pub fn post_task_and_reply(
        &self,
        task: impl FnOnce() + Send + 'static,
        reply: impl FnOnce() + Send + 'static,
    ) -> bool {
        self.handle().post_task_and_reply(task, reply)
    }

    #[track_caller]
    pub fn delete_soon<T: Send + 'static>(&self, object: Box<T>) -> bool {
        self.handle().delete_soon(object)
    }

    #[track_caller]
    pub fn release_soon<T: Send + Sync + 'static>(&self, object: Arc<T>) -> bool {
        self.handle().release_soon(object)
    }

    /// Current run depth; zero while no run loop is active.
    pub fn run_depth(&self) -> usize {
        self.current_run_loop
            .borrow()
            .as_ref()
            .map_or(0, |run_loop| run_loop.run_depth())
    }

    pub fn is_nested(&self) -> bool {
        self.run_depth() > 1
    }

    /// Quits the current run loop once it runs out of work.
    pub fn quit_when_idle(&self) {
        match self.current_run_loop.borrow().as_ref() {
            Some(run_loop) => run_loop.quit_when_idle_received.set(true),
            None => log::warn!("quit_when_idle called with no run loop active"),
        }
    }

    /// Quits the current run loop as soon as control returns to the pump.
    pub fn quit_now(&self) {
        match self.current_run_loop.borrow().as_ref() {
            Some(run_loop) => run_loop.quit_called.set(true),
            None => log::warn!("quit_now called with no run loop active"),
        }
    }

    /// Installs a predicate consulted once per pass when no other work is
    /// pending. Returning `true` reports that more work is plausible.
    ///
    /// The signal is checked after immediate and delayed work, so sustained
    /// task load can starve it.
    pub fn set_extension_signal_handler(&self, handler: impl Fn() -> bool + 'static) {
        *self.extension_signal.borrow_mut() = Some(Rc::new(handler));
    }

    pub fn clear_extension_signal_handler(&self) {
        self.extension_signal.borrow_mut().take();
    }

    /// The pump, for callers that need variant-specific access.
    pub fn pump(&self) -> &MessagePump {
        &self.pump
    }

    pub fn io_pump(&self) -> Option<&IoPump> {
        match &self.pump {
            MessagePump::Io(pump) => Some(pump),
            _ => None,
        }
    }

    pub fn ui_pump(&self) -> Option<&UiPump> {
        match &self.pump {
            MessagePump::Ui(pump) => Some(pump),
            _ => None,
        }
    }

    /// Routes completions of operations on `fd` to `handler`.
    ///
    /// # Errors
    /// [`LoopError::WrongPumpKind`] unless this is an I/O loop.
    pub fn register_io_handler(
        &self,
        fd: RawFd,
        handler: Weak<dyn IoHandler>,
    ) -> Result<(), LoopError> {
        let pump = self.io_pump().ok_or(LoopError::WrongPumpKind {
            expected: PumpKind::Io,
            actual: self.pump_kind(),
        })?;

        pump.register_io_handler(fd, handler)?;
        Ok(())
    }

    pub(crate) fn run_internal(&self) {
        self.pump.run(self);
    }

    pub(crate) fn set_run_depth(&self, depth: usize) {
        self.shared.run_depth.store(depth, Ordering::Release);
    }

    fn reload_work_queue(&self) {
        let mut work_queue = self.work_queue.borrow_mut();
        if work_queue.is_empty() {
            self.shared.incoming.reload_work_queue(&mut work_queue);
        }
    }

    fn add_to_delayed_work_queue(&self, task: PendingTask) {
        let sequence_num = task.sequence_num();
        let delayed_run_time = task.delayed_run_time();

        let is_earliest = {
            let mut heap = self.delayed_work_queue.borrow_mut();
            heap.push(DelayedTask(task));
            heap.peek().is_some_and(|top| top.0.sequence_num() == sequence_num)
        };

        if is_earliest {
            self.pump.schedule_delayed_work(delayed_run_time);
        }
    }

    // Runs `task` unless it is non-nestable and we are nested, in which case
    // it waits in the deferred queue. Returns whether it ran.
    fn defer_or_run_pending_task(&self, task: PendingTask) -> bool {
        if task.nestable() || self.run_depth() == 1 {
            task.run();
            return true;
        }

        self.deferred_non_nestable_work_queue
            .borrow_mut()
            .push_back(task);
        false
    }

    fn process_next_delayed_non_nestable_task(&self) -> bool {
        if self.run_depth() != 1 {
            return false;
        }

        let task = self.deferred_non_nestable_work_queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    fn current_run_loop_state(&self) -> Option<Rc<RunLoopState>> {
        self.current_run_loop.borrow().clone()
    }
}

impl PumpDelegate for MessageLoop {
    fn should_quit_current_loop(&self) -> bool {
        self.current_run_loop
            .borrow()
            .as_ref()
            .is_none_or(|run_loop| run_loop.quit_called.get())
    }

    fn quit_current_loop_now(&self) {
        self.quit_now();
    }

    fn do_work(&self) -> bool {
        loop {
            self.reload_work_queue();
            if self.work_queue.borrow().is_empty() {
                return false;
            }

            loop {
                let next = self.work_queue.borrow_mut().pop_front();
                let Some(task) = next else {
                    break;
                };

                // Delay is resolved after intake so both post paths share
                // one queue.
                if !task.delayed_run_time().is_null() {
                    self.add_to_delayed_work_queue(task);
                } else if self.defer_or_run_pending_task(task) {
                    return true;
                }
            }
        }
    }

    fn do_delayed_work(&self, next_delayed_work_time: &Cell<TimeTicks>) -> bool {
        let next_run_time = match self.delayed_work_queue.borrow().peek() {
            Some(top) => top.0.delayed_run_time(),
            None => {
                self.recent_time.set(TimeTicks::null());
                next_delayed_work_time.set(TimeTicks::null());
                return false;
            }
        };

        // Only sample the clock when the cached time says we are early.
        if next_run_time > self.recent_time.get() {
            self.recent_time.set(TimeTicks::now());
            if next_run_time > self.recent_time.get() {
                next_delayed_work_time.set(next_run_time);
                return false;
            }
        }

        let task = {
            let mut heap = self.delayed_work_queue.borrow_mut();
            let task = heap.pop();
            next_delayed_work_time.set(
                heap.peek()
                    .map_or(TimeTicks::null(), |top| top.0.delayed_run_time()),
            );
            task
        };

        match task {
            Some(DelayedTask(task)) => self.defer_or_run_pending_task(task),
            None => false,
        }
    }

    fn do_idle_work(&self) -> bool {
        if self.process_next_delayed_non_nestable_task() {
            return true;
        }

        if let Some(run_loop) = self.current_run_loop_state()
            && run_loop.quit_when_idle_received.get()
        {
            run_loop.quit_called.set(true);
        }

        false
    }

    fn check_extension_signal(&self) -> bool {
        let signal = self.extension_signal.borrow().clone();
        signal.is_some_and(|signal| signal())
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        // A panicking task unwinds through the running loop.
        debug_assert!(
            self.current_run_loop.get_mut().is_none() || std::thread::panicking(),
            "message loop dropped while running"
        );

        self.shared.incoming.shut_down();
        self.work_queue.get_mut().clear();
        self.delayed_work_queue.get_mut().clear();
        self.deferred_non_nestable_work_queue.get_mut().clear();
        self.set_run_depth(0);

        context::unregister(self);
        log::debug!("destroyed {} message loop", self.shared.kind);
    }
}
