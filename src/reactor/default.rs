//! Default pump: a single auto-reset event is the only wake source.

use crate::reactor::PumpDelegate;
use crate::reactor::waitable::WaitableEvent;
use crate::time::{TimeTicks, delay_until};

use std::cell::Cell;
use std::sync::Arc;

/// Pump variant that blocks on a [`WaitableEvent`].
///
/// `schedule_work` signals the event from any thread; delayed work only
/// shortens the next wait.
pub struct DefaultPump {
    event: Arc<WaitableEvent>,
    delayed_work_time: Cell<TimeTicks>,
}

impl DefaultPump {
    pub(crate) fn new() -> Self {
        Self {
            event: Arc::new(WaitableEvent::new()),
            delayed_work_time: Cell::new(TimeTicks::null()),
        }
    }

    pub(crate) fn event(&self) -> Arc<WaitableEvent> {
        self.event.clone()
    }

    pub(crate) fn schedule_delayed_work(&self, delayed_work_time: TimeTicks) {
        self.delayed_work_time.set(delayed_work_time);
    }

    pub(crate) fn run(&self, delegate: &dyn PumpDelegate) {
        loop {
            let mut more_work_is_plausible = delegate.do_work();
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= delegate.do_delayed_work(&self.delayed_work_time);
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

            match delay_until(self.delayed_work_time.get()) {
                None => self.event.wait(),
                Some(delay) if !delay.is_zero() => {
                    self.event.timed_wait(delay);
                }
                // The deadline already passed; let the next pass pick it up.
                Some(_) => self.delayed_work_time.set(TimeTicks::null()),
            }
        }
    }
}
