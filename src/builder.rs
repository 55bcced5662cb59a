//! Fluent builder for [`Thread`] construction.
//!
//! Provides a builder pattern interface for naming a thread, choosing the
//! pump its message loop runs on and installing a [`ThreadDelegate`].

use crate::error::LoopError;
use crate::reactor::PumpKind;
use crate::thread::{Thread, ThreadDelegate};

/// Options a [`Thread`] is started with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadOptions {
    /// Pump the thread's message loop is created with.
    pub pump_kind: PumpKind,

    /// Stack size of the OS thread; the platform default when `None`.
    pub stack_size: Option<usize>,
}

impl ThreadOptions {
    pub fn new(pump_kind: PumpKind) -> Self {
        Self {
            pump_kind,
            stack_size: None,
        }
    }
}

/// Builder for constructing and starting [`Thread`] instances.
///
/// # Example
/// ```ignore
/// let thread = Thread::builder("io")
///     .pump_kind(PumpKind::Io)
///     .stack_size(256 * 1024)
///     .start()?;
/// ```
pub struct ThreadBuilder {
    name: String,
    options: ThreadOptions,
    delegate: Option<Box<dyn ThreadDelegate>>,
}

impl ThreadBuilder {
    /// Creates a builder for a thread called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ThreadOptions::default(),
            delegate: None,
        }
    }

    /// Selects the pump of the thread's message loop.
    pub fn pump_kind(mut self, kind: PumpKind) -> Self {
        self.options.pump_kind = kind;
        self
    }

    /// Sets the OS thread's stack size in bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.options.stack_size = Some(size);
        self
    }

    /// Installs the delegate whose `init`/`run`/`clean_up` the thread runs.
    pub fn delegate(mut self, delegate: impl ThreadDelegate) -> Self {
        self.delegate = Some(Box::new(delegate));
        self
    }

    /// Builds the thread without starting it.
    pub fn build(self) -> (Thread, ThreadOptions) {
        let thread = match self.delegate {
            Some(delegate) => Thread::with_boxed_delegate(self.name, delegate),
            None => Thread::new(self.name),
        };
        (thread, self.options)
    }

    /// Builds and starts the thread.
    ///
    /// # Errors
    /// Whatever [`Thread::start_with_options`] reports.
    pub fn start(self) -> Result<Thread, LoopError> {
        let (mut thread, options) = self.build();
        thread.start_with_options(options)?;
        Ok(thread)
    }
}
