//! UI pump: interleaves task dispatch with a native event queue.
//!
//! The native queue models a thread message queue. Application messages are
//! posted to it from any thread through a [`UiHandle`] and dispatched to the
//! handler installed with [`UiPump::set_message_handler`].
//!
//! The pump talks to the queue through three kinds of internal entries:
//!
//! - a *have-work* sentinel posted by `schedule_work`, coalesced so at most
//!   one is in flight;
//! - a one-shot *timer*, armed for delayed work as a fallback wake source;
//! - a *quit* message, which quits the current run loop and is re-posted so
//!   that every enclosing run loop unwinds as well.

use crate::reactor::PumpDelegate;
use crate::time::{TimeTicks, delay_until};

use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Smallest delay the native timer supports.
const TIMER_MINIMUM: Duration = Duration::from_millis(10);

/// An application-defined native message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeMessage {
    pub id: u32,
    pub wparam: usize,
    pub lparam: isize,
}

impl NativeMessage {
    pub fn new(id: u32, wparam: usize, lparam: isize) -> Self {
        Self { id, wparam, lparam }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NativeEvent {
    HaveWork,
    Timer,
    Quit(i32),
    Message(NativeMessage),
}

#[derive(Default)]
struct NativeState {
    events: VecDeque<NativeEvent>,
    timer: Option<Instant>,
}

/// The native event queue shared between the UI pump and its posters.
#[derive(Default)]
pub(crate) struct NativeEventQueue {
    state: Mutex<NativeState>,
    condvar: Condvar,
    have_work: AtomicBool,
}

impl NativeEventQueue {
    fn post(&self, event: NativeEvent) {
        self.state.lock().events.push_back(event);
        self.condvar.notify_one();
    }

    /// Posts the have-work sentinel unless one is already queued.
    pub(crate) fn schedule_work(&self) {
        if self.have_work.swap(true, Ordering::AcqRel) {
            return;
        }
        self.post(NativeEvent::HaveWork);
    }

    fn set_timer(&self, deadline: Instant) {
        self.state.lock().timer = Some(deadline);
        self.condvar.notify_one();
    }

    fn kill_timer(&self) {
        self.state.lock().timer = None;
    }

    fn has_pending_messages(&self) -> bool {
        !self.state.lock().events.is_empty()
    }

    // Queued entries come first; a due timer is reported only once nothing
    // else is waiting, and fires once.
    fn peek(&self) -> Option<NativeEvent> {
        let mut state = self.state.lock();
        if let Some(event) = state.events.pop_front() {
            return Some(event);
        }

        match state.timer {
            Some(deadline) if deadline <= Instant::now() => {
                state.timer = None;
                Some(NativeEvent::Timer)
            }
            _ => None,
        }
    }

    // Blocks until an entry is queued, the timer is due or `timeout` passes.
    fn wait(&self, timeout: Option<Duration>) {
        let limit = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();

        loop {
            if !state.events.is_empty() {
                return;
            }

            let deadline = match (limit, state.timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            match deadline {
                None => self.condvar.wait(&mut state),
                Some(deadline) => {
                    if deadline <= Instant::now() {
                        return;
                    }
                    let _ = self.condvar.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

/// `Send` handle for posting to a UI pump's native queue from any thread.
#[derive(Clone)]
pub struct UiHandle {
    queue: Arc<NativeEventQueue>,
}

impl UiHandle {
    /// Posts an application message.
    pub fn post_message(&self, message: NativeMessage) {
        self.queue.post(NativeEvent::Message(message));
    }

    /// Posts a quit message carrying `exit_code`.
    pub fn post_quit(&self, exit_code: i32) {
        self.queue.post(NativeEvent::Quit(exit_code));
    }
}

type MessageHandler = Rc<dyn Fn(&NativeMessage)>;

/// Pump variant that drains a native event queue between task passes.
pub struct UiPump {
    queue: Arc<NativeEventQueue>,
    handler: RefCell<Option<MessageHandler>>,
    delayed_work_time: Cell<TimeTicks>,
    exit_code: Cell<Option<i32>>,
}

impl UiPump {
    pub(crate) fn new() -> Self {
        Self {
            queue: Arc::new(NativeEventQueue::default()),
            handler: RefCell::new(None),
            delayed_work_time: Cell::new(TimeTicks::null()),
            exit_code: Cell::new(None),
        }
    }

    pub(crate) fn native_queue(&self) -> Arc<NativeEventQueue> {
        self.queue.clone()
    }

    pub fn handle(&self) -> UiHandle {
        UiHandle {
            queue: self.queue.clone(),
        }
    }

    /// Installs the procedure that receives application messages.
    pub fn set_message_handler(&self, handler: impl Fn(&NativeMessage) + 'static) {
        *self.handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Exit code of the last quit message processed, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    pub(crate) fn schedule_delayed_work(&self, delayed_work_time: TimeTicks) {
        self.delayed_work_time.set(delayed_work_time);

        let Some(delay) = delay_until(delayed_work_time) else {
            return;
        };
        self.queue
            .set_timer(Instant::now() + delay.max(TIMER_MINIMUM));
    }

    pub(crate) fn run(&self, delegate: &dyn PumpDelegate) {
        loop {
            let mut more_work_is_plausible = self.process_next_native_message(delegate);
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= delegate.do_work();
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= delegate.do_delayed_work(&self.delayed_work_time);
            if self.delayed_work_time.get().is_null() {
                self.queue.kill_timer();
            }
            if delegate.should_quit_current_loop() {
                return;
            }

            if more_work_is_plausible {
                continue;
            }

            more_work_is_plausible = delegate.do_idle_work();
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= delegate.check_extension_signal();
            if delegate.should_quit_current_loop() {
                return;
            }

            if more_work_is_plausible {
                continue;
            }

            self.queue.wait(delay_until(self.delayed_work_time.get()));
        }
    }

    fn process_next_native_message(&self, delegate: &dyn PumpDelegate) -> bool {
        match self.queue.peek() {
            Some(event) => self.process_message(event, delegate),
            None => false,
        }
    }

    fn process_message(&self, event: NativeEvent, delegate: &dyn PumpDelegate) -> bool {
        match event {
            NativeEvent::Quit(code) => {
                self.exit_code.set(Some(code));
                delegate.quit_current_loop_now();
                // Let every enclosing loop see it too.
                self.queue.post(NativeEvent::Quit(code));
                false
            }
            NativeEvent::HaveWork => self.process_pump_replacement_message(delegate),
            NativeEvent::Timer => {
                self.handle_timer(delegate);
                true
            }
            NativeEvent::Message(message) => {
                let handler = self.handler.borrow().clone();
                match handler {
                    Some(handler) => handler(&message),
                    None => log::trace!("no handler for native message {:#x}", message.id),
                }
                true
            }
        }
    }

    // The sentinel stood in for a native message; dispatch one real message
    // in its place, re-arming the sentinel so task dispatch is not starved.
    fn process_pump_replacement_message(&self, delegate: &dyn PumpDelegate) -> bool {
        self.queue.have_work.store(false, Ordering::Release);

        if !self.queue.has_pending_messages() {
            return false;
        }

        let Some(event) = self.queue.peek() else {
            return false;
        };

        self.queue.schedule_work();
        self.process_message(event, delegate)
    }

    fn handle_timer(&self, delegate: &dyn PumpDelegate) {
        self.queue.kill_timer();

        delegate.do_delayed_work(&self.delayed_work_time);
        let next = self.delayed_work_time.get();
        if !next.is_null() {
            self.schedule_delayed_work(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_coalesced() {
        let queue = NativeEventQueue::default();
        queue.schedule_work();
        queue.schedule_work();

        assert_eq!(queue.peek(), Some(NativeEvent::HaveWork));
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn timer_fires_once_after_queued_messages() {
        let queue = NativeEventQueue::default();
        queue.set_timer(Instant::now());
        queue.post(NativeEvent::Message(NativeMessage::new(1, 0, 0)));

        assert!(matches!(queue.peek(), Some(NativeEvent::Message(_))));
        assert_eq!(queue.peek(), Some(NativeEvent::Timer));
        assert_eq!(queue.peek(), None);
    }

    // Delayed work drained, nothing else to do; quits from the extension
    // signal on the first idle pass.
    #[derive(Default)]
    struct DrainedDelegate {
        quit: Cell<bool>,
        delayed_calls: Cell<usize>,
    }

    impl PumpDelegate for DrainedDelegate {
        fn should_quit_current_loop(&self) -> bool {
            self.quit.get()
        }

        fn quit_current_loop_now(&self) {
            self.quit.set(true);
        }

        fn do_work(&self) -> bool {
            false
        }

        fn do_delayed_work(&self, next_delayed_work_time: &Cell<TimeTicks>) -> bool {
            self.delayed_calls.set(self.delayed_calls.get() + 1);
            next_delayed_work_time.set(TimeTicks::null());
            false
        }

        fn do_idle_work(&self) -> bool {
            false
        }

        fn check_extension_signal(&self) -> bool {
            self.quit.set(true);
            false
        }
    }

    #[test]
    fn timer_is_killed_once_no_delayed_work_remains() {
        let pump = UiPump::new();
        pump.schedule_delayed_work(TimeTicks::from_delay(Duration::from_secs(60)));
        assert!(pump.queue.state.lock().timer.is_some());

        let delegate = DrainedDelegate::default();
        pump.run(&delegate);

        assert_eq!(delegate.delayed_calls.get(), 1);
        assert!(pump.queue.state.lock().timer.is_none());
    }

    #[test]
    fn wait_returns_when_timer_is_due() {
        let queue = NativeEventQueue::default();
        queue.set_timer(Instant::now() + Duration::from_millis(15));

        let start = Instant::now();
        queue.wait(None);
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(queue.peek(), Some(NativeEvent::Timer));
    }
}
