//! Single-threaded cooperative message loops with pluggable pumps.
//!
//! Each OS thread runs at most one [`MessageLoop`]. Tasks are posted to it
//! from any thread through a [`LoopHandle`] and run in order on the loop's
//! own thread, interleaved with whatever event source its pump waits on.
//!
//! # Architecture
//!
//! - **MessageLoop**: owns the incoming queue, the work queue, the delayed
//!   heap and the deferred non-nestable queue, and drives them for its pump
//! - **RunLoop**: one (possibly nested) invocation of a loop
//! - **Pumps**: default (event wait), UI (native event queue) and I/O
//!   (epoll completions)
//! - **Thread**: an OS thread that creates and runs its own loop
//! - **net**: named pipe server and client over the I/O pump
//! - **ipc**: framed messages with a hello handshake over a pipe
//!
//! # Example
//!
//! ```ignore
//! use msgloop::{PumpKind, Thread};
//!
//! let mut worker = Thread::builder("worker").pump_kind(PumpKind::Default).start()?;
//! worker.handle().unwrap().post_task(|| log::info!("hello from the worker"));
//! worker.stop();
//! ```

mod builder;
pub mod error;
pub mod ipc;
pub mod net;
pub mod reactor;
mod runtime;
pub mod task;
mod thread;
pub mod time;

pub use builder::{ThreadBuilder, ThreadOptions};
pub use error::{ChannelError, LoopError, PickleError, ProtocolError};
pub use reactor::{
    IoContext, IoHandler, IoOperation, MessagePump, NativeMessage, PumpKind, UiHandle,
    WaitableEvent,
};
pub use runtime::{LoopHandle, MessageLoop, RunLoop};
pub use task::{Closure, PendingTask};
pub use thread::{Thread, ThreadDelegate};
