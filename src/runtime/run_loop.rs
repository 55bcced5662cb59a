//! Run loops: one invocation of a message loop's pump.
//!
//! Run loops on a message loop form a stack. Each [`RunLoop`] records its
//! depth and the run loop it interrupted, so `is_nested()` answers correctly
//! from any call site and quitting the inner loop hands control back to the
//! enclosing one.

use crate::error::LoopError;
use crate::runtime::MessageLoop;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Per-invocation state shared between a [`RunLoop`] and its message loop.
#[derive(Default)]
pub(crate) struct RunLoopState {
    run_depth: Cell<usize>,
    run_called: Cell<bool>,
    running: Cell<bool>,
    pub(crate) quit_called: Cell<bool>,
    pub(crate) quit_when_idle_received: Cell<bool>,
    previous: RefCell<Option<Rc<RunLoopState>>>,
}

impl RunLoopState {
    pub(crate) fn run_depth(&self) -> usize {
        self.run_depth.get()
    }
}

/// Runs the current thread's message loop until quit.
///
/// A run loop runs at most once; quitting is terminal. `quit` may be called
/// before `run`, in which case `run` returns immediately.
///
/// # Example
///
/// ```ignore
/// let message_loop = MessageLoop::new(PumpKind::Default)?;
/// let run_loop = RunLoop::new()?;
/// let quit = run_loop.quit_closure();
/// message_loop.post_task(move || { /* ... */ });
/// run_loop.run_until_idle();
/// ```
pub struct RunLoop {
    message_loop: Rc<MessageLoop>,
    state: Rc<RunLoopState>,
}

impl RunLoop {
    /// Creates a run loop bound to the current thread's message loop.
    pub fn new() -> Result<Self, LoopError> {
        let message_loop = MessageLoop::current().ok_or(LoopError::NoCurrentLoop)?;
        Ok(Self::with_loop(message_loop))
    }

    pub fn with_loop(message_loop: Rc<MessageLoop>) -> Self {
        Self {
            message_loop,
            state: Rc::new(RunLoopState::default()),
        }
    }

    /// Runs until [`quit`](Self::quit) is called.
    pub fn run(&self) {
        if !self.before_run() {
            return;
        }

        self.message_loop.run_internal();
        self.after_run();
    }

    /// Runs until there is no more immediate or due work, then returns.
    pub fn run_until_idle(&self) {
        self.state.quit_when_idle_received.set(true);
        self.run();
    }

    /// Quits the run loop as soon as control returns to it.
    pub fn quit(&self) {
        self.state.quit_called.set(true);
    }

    /// Quits the run loop once it runs out of work.
    pub fn quit_when_idle(&self) {
        self.state.quit_when_idle_received.set(true);
    }

    /// Closure that quits this run loop; does nothing once it is gone.
    pub fn quit_closure(&self) -> impl Fn() + 'static {
        let state: Weak<RunLoopState> = Rc::downgrade(&self.state);
        move || {
            if let Some(state) = state.upgrade() {
                state.quit_called.set(true);
            }
        }
    }

    pub fn running(&self) -> bool {
        self.state.running.get()
    }

    pub fn quitted(&self) -> bool {
        self.state.quit_called.get()
    }

    /// Depth of this run loop while running; zero otherwise.
    pub fn run_depth(&self) -> usize {
        self.state.run_depth.get()
    }

    fn before_run(&self) -> bool {
        let state = &self.state;

        if state.run_called.replace(true) {
            debug_assert!(!state.running.get(), "run loop is already running");
            log::warn!("run loop ran twice");
            return false;
        }

        if state.quit_called.get() {
            return false;
        }

        let previous = self.message_loop.current_run_loop.borrow().clone();
        if previous.as_ref().is_some_and(|previous| previous.quit_called.get()) {
            return false;
        }

        let depth = previous.as_ref().map_or(1, |previous| previous.run_depth() + 1);
        state.run_depth.set(depth);
        *state.previous.borrow_mut() = previous;
        state.running.set(true);

        *self.message_loop.current_run_loop.borrow_mut() = Some(state.clone());
        self.message_loop.set_run_depth(depth);

        log::trace!("entering run loop at depth {depth}");
        true
    }

    fn after_run(&self) {
        let state = &self.state;
        state.running.set(false);

        let previous = state.previous.borrow_mut().take();
        let depth = previous.as_ref().map_or(0, |previous| previous.run_depth());

        *self.message_loop.current_run_loop.borrow_mut() = previous;
        self.message_loop.set_run_depth(depth);

        log::trace!("left run loop at depth {}", state.run_depth());
        state.run_depth.set(0);
    }
}
