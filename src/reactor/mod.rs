//! Message pumps: the event-wait strategies a message loop runs on.
//!
//! A pump never decides *what* runs. It calls back into the message loop
//! for each phase of a pass and blocks only when every phase reports no
//! more work. Three variants exist:
//!
//! - [`default`]: waits on a single [`WaitableEvent`].
//! - [`ui`]: pumps a native event queue between task passes.
//! - [`io`]: waits on epoll and dispatches I/O completions.
//!
//! Supporting modules:
//! - [`poller`]: the `epoll(7)` wrapper used by the I/O pump
//! - [`waitable`]: the auto-reset event used by the default pump

pub mod default;
pub mod io;
pub(crate) mod poller;
pub mod ui;
pub mod waitable;

pub use default::DefaultPump;
pub use io::{IoContext, IoHandler, IoOperation, IoPump};
pub use ui::{NativeMessage, UiHandle, UiPump};
pub use waitable::WaitableEvent;

use crate::time::TimeTicks;

use std::cell::Cell;
use std::fmt;
use std::io as stdio;
use std::sync::Arc;

/// Selects the pump a message loop is constructed with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PumpKind {
    #[default]
    Default,
    Ui,
    Io,
}

impl fmt::Display for PumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PumpKind::Default => "default",
            PumpKind::Ui => "ui",
            PumpKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// Callbacks a pump drives during each pass of its run loop.
///
/// Implemented by the message loop. Every method runs on the loop's thread.
pub(crate) trait PumpDelegate {
    /// Whether the run loop currently being dispatched has been asked to quit.
    fn should_quit_current_loop(&self) -> bool;

    /// Quits the current run loop right away (native quit message).
    fn quit_current_loop_now(&self);

    /// Runs one immediate task. Returns `true` if more work may be pending.
    fn do_work(&self) -> bool;

    /// Runs one due delayed task, storing the next deadline in
    /// `next_delayed_work_time` (null when none remain).
    fn do_delayed_work(&self, next_delayed_work_time: &Cell<TimeTicks>) -> bool;

    /// Runs deferred work once nothing else is left, or honors a
    /// quit-when-idle request.
    fn do_idle_work(&self) -> bool;

    /// Consults the extension signal, if one is installed.
    fn check_extension_signal(&self) -> bool;
}

/// A message loop's pump, one of the three known variants.
pub enum MessagePump {
    Default(DefaultPump),
    Ui(UiPump),
    Io(IoPump),
}

impl MessagePump {
    pub(crate) fn new(kind: PumpKind) -> stdio::Result<Self> {
        Ok(match kind {
            PumpKind::Default => MessagePump::Default(DefaultPump::new()),
            PumpKind::Ui => MessagePump::Ui(UiPump::new()),
            PumpKind::Io => MessagePump::Io(IoPump::new()?),
        })
    }

    pub fn kind(&self) -> PumpKind {
        match self {
            MessagePump::Default(_) => PumpKind::Default,
            MessagePump::Ui(_) => PumpKind::Ui,
            MessagePump::Io(_) => PumpKind::Io,
        }
    }

    /// Runs passes until the delegate's current run loop quits.
    pub(crate) fn run(&self, delegate: &dyn PumpDelegate) {
        match self {
            MessagePump::Default(pump) => pump.run(delegate),
            MessagePump::Ui(pump) => pump.run(delegate),
            MessagePump::Io(pump) => pump.run(delegate),
        }
    }

    /// Arms (or, for a null time, disarms) the next delayed-work wakeup.
    pub(crate) fn schedule_delayed_work(&self, delayed_work_time: TimeTicks) {
        match self {
            MessagePump::Default(pump) => pump.schedule_delayed_work(delayed_work_time),
            MessagePump::Ui(pump) => pump.schedule_delayed_work(delayed_work_time),
            MessagePump::Io(pump) => pump.schedule_delayed_work(delayed_work_time),
        }
    }

    /// Cross-thread half of the pump, used to schedule work.
    pub(crate) fn waker(&self) -> PumpWaker {
        match self {
            MessagePump::Default(pump) => PumpWaker::Event(pump.event()),
            MessagePump::Ui(pump) => PumpWaker::Ui(pump.native_queue()),
            MessagePump::Io(pump) => PumpWaker::Io(pump.waker()),
        }
    }
}

/// `Send + Sync` wakeup path of a pump, held by the incoming task queue.
#[derive(Clone)]
pub(crate) enum PumpWaker {
    Event(Arc<WaitableEvent>),
    Ui(Arc<ui::NativeEventQueue>),
    Io(Arc<io::IoWaker>),
}

impl PumpWaker {
    /// Makes the owning pump run a pass soon. Safe to call from any thread.
    pub(crate) fn schedule_work(&self) {
        match self {
            PumpWaker::Event(event) => event.signal(),
            PumpWaker::Ui(queue) => queue.schedule_work(),
            PumpWaker::Io(waker) => waker.schedule_work(),
        }
    }
}
