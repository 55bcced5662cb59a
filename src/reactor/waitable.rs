use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Auto-reset event: one `signal` releases one `wait`.
///
/// Signals are sticky until consumed, so a signal raised before the waiter
/// blocks is never lost.
#[derive(Debug, Default)]
pub struct WaitableEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WaitableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event and wakes one waiter.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Returns `true` if the event is currently set, without consuming it.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until the event is set, then resets it.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Blocks until the event is set or `timeout` elapses.
    ///
    /// Returns `true` if the event was consumed.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();

        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }

        let was_signaled = *signaled;
        *signaled = false;
        was_signaled
    }
}
