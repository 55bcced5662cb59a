//! An OS thread that owns a message loop.
//!
//! The loop is constructed inside the new thread's entry point, never by the
//! caller, and [`Thread::start`] returns only once it exists, so
//! [`Thread::handle`] is usable right away.
//!
//! ```ignore
//! let mut thread = Thread::new("worker");
//! thread.start()?;
//! thread.handle().unwrap().post_task(|| log::info!("on worker"));
//! thread.stop();
//! ```

use crate::builder::{ThreadBuilder, ThreadOptions};
use crate::error::LoopError;
use crate::reactor::WaitableEvent;
use crate::runtime::{LoopHandle, MessageLoop, RunLoop};

use parking_lot::Mutex;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Hooks run on the thread around its message loop.
pub trait ThreadDelegate: Send + 'static {
    /// Runs on the new thread before the loop starts.
    fn init(&mut self) {}

    /// Runs the loop. The default runs a [`RunLoop`] until it is quit.
    fn run(&mut self, message_loop: &Rc<MessageLoop>) {
        RunLoop::with_loop(message_loop.clone()).run();
    }

    /// Runs on the thread after the loop has returned, before it is dropped.
    fn clean_up(&mut self) {}
}

struct PlainThread;

impl ThreadDelegate for PlainThread {}

struct Startup {
    event: WaitableEvent,
    result: Mutex<Option<Result<LoopHandle, LoopError>>>,
}

/// A named OS thread running a message loop.
///
/// Dropping a running thread stops it.
pub struct Thread {
    name: String,
    delegate: Option<Box<dyn ThreadDelegate>>,
    handle: Option<LoopHandle>,
    join_handle: Option<JoinHandle<()>>,
}

impl Thread {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_boxed_delegate(name.into(), Box::new(PlainThread))
    }

    pub fn with_delegate(name: impl Into<String>, delegate: impl ThreadDelegate) -> Self {
        Self::with_boxed_delegate(name.into(), Box::new(delegate))
    }

    pub(crate) fn with_boxed_delegate(name: String, delegate: Box<dyn ThreadDelegate>) -> Self {
        Self {
            name,
            delegate: Some(delegate),
            handle: None,
            join_handle: None,
        }
    }

    pub fn builder(name: impl Into<String>) -> ThreadBuilder {
        ThreadBuilder::new(name)
    }

    /// Starts the thread with a default pump.
    pub fn start(&mut self) -> Result<(), LoopError> {
        self.start_with_options(ThreadOptions::default())
    }

    /// Spawns the OS thread and blocks until its message loop exists.
    ///
    /// # Errors
    /// [`LoopError::Io`] if the OS thread or the pump cannot be created.
    /// Starting an already started thread is a no-op.
    pub fn start_with_options(&mut self, options: ThreadOptions) -> Result<(), LoopError> {
        let Some(mut delegate) = self.delegate.take() else {
            log::warn!("thread {:?} was already started", self.name);
            return Ok(());
        };

        let startup = Arc::new(Startup {
            event: WaitableEvent::new(),
            result: Mutex::new(None),
        });

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = options.stack_size {
            builder = builder.stack_size(size);
        }

        let signal = startup.clone();
        let join_handle = builder.spawn(move || {
            let message_loop = match MessageLoop::new(options.pump_kind) {
                Ok(message_loop) => message_loop,
                Err(err) => {
                    *signal.result.lock() = Some(Err(err));
                    signal.event.signal();
                    return;
                }
            };

            *signal.result.lock() = Some(Ok(message_loop.handle()));
            signal.event.signal();
            drop(signal);

            delegate.init();
            delegate.run(&message_loop);
            delegate.clean_up();

            drop(delegate);
            drop(message_loop);
        })?;

        startup.event.wait();
        let result = startup
            .result
            .lock()
            .take()
            .unwrap_or_else(|| Err(io::Error::other("thread exited before its loop started").into()));

        match result {
            Ok(handle) => {
                log::debug!("started thread {:?}", self.name);
                self.handle = Some(handle);
                self.join_handle = Some(join_handle);
                Ok(())
            }
            Err(err) => {
                if join_handle.join().is_err() {
                    log::error!("thread {:?} panicked during startup", self.name);
                }
                Err(err)
            }
        }
    }

    /// Quits the thread's loop once it is idle and joins the thread.
    ///
    /// Must not be called while the loop is nested: a single quit cannot
    /// unwind several run loops. Stopping a stopped thread does nothing.
    pub fn stop(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };

        if let Some(handle) = self.handle.take() {
            debug_assert!(!handle.is_nested(), "stopping a thread whose loop is nested");
            handle.quit_when_idle();
        }

        if join_handle.join().is_err() {
            log::error!("thread {:?} panicked", self.name);
        }

        log::debug!("stopped thread {:?}", self.name);
    }

    /// Handle to the thread's message loop while it runs.
    pub fn handle(&self) -> Option<LoopHandle> {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|join_handle| !join_handle.is_finished())
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.join_handle
            .as_ref()
            .map(|join_handle| join_handle.thread().id())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.stop();
    }
}
