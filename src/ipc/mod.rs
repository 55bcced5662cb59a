//! Framed inter-process messaging on top of the pipe transport.
//!
//! - [`pickle`]: aligned primitive field encoding for payloads
//! - [`message`]: frame header, hello frame and frame scanning
//! - [`channel`]: the [`IpcChannel`] with its handshake and outgoing queue
//! - [`listener`]: the [`IpcListener`] callbacks

pub mod channel;
mod listener;
pub mod message;
pub mod pickle;

pub use channel::{ChannelMode, ChannelOptions, IpcChannel};
pub use listener::IpcListener;
pub use message::{
    HEADER_SIZE, HELLO_MESSAGE_TYPE, IpcMessage, MAXIMUM_MESSAGE_SIZE, MSG_ROUTING_CONTROL,
    MSG_ROUTING_NONE, Priority,
};
pub use pickle::{Pickle, PickleIterator};
