//! Named pipe transport over the I/O pump.
//!
//! - [`server`]: accept slots that turn into client connections
//! - [`client`]: a single connection to a named endpoint
//!
//! Every write is limited to [`IO_BUFFER_SIZE`] bytes and each connection
//! has at most one read and one write outstanding. Callers that need to move
//! larger records split them, as the IPC channel does.

pub mod client;
mod pipe;
pub mod server;
mod socket;

pub use client::{PipeClient, PipeClientDelegate};
pub use server::{ClientKey, PipeServer, PipeServerDelegate, PipeServerOptions};

/// Size of the per-direction transfer buffer of a pipe connection.
pub const IO_BUFFER_SIZE: usize = 4096;
