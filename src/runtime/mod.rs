//! Message loop subsystem modules.

pub(crate) mod context;
mod core;
mod handle;
pub(crate) mod queue;
mod run_loop;

pub use core::MessageLoop;
pub use handle::LoopHandle;
pub(crate) use queue::IncomingTaskQueue;
pub use run_loop::RunLoop;
