//! Error types shared by the loop, the transport and the IPC layer.

use crate::reactor::PumpKind;

use std::io;
use thiserror::Error;

/// Errors raised while creating or addressing a message loop.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The calling thread already owns a message loop.
    #[error("a message loop is already registered on this thread")]
    AlreadyRegistered,

    /// The calling thread has no message loop.
    #[error("no message loop is registered on this thread")]
    NoCurrentLoop,

    /// The operation needs a pump the loop was not built with.
    #[error("operation requires a {expected:?} pump, loop runs a {actual:?} pump")]
    WrongPumpKind {
        /// Pump kind the operation needs
        expected: PumpKind,
        /// Pump kind of the current loop
        actual: PumpKind,
    },

    /// The OS refused to create a pump resource.
    #[error("pump setup failed: {0}")]
    Io(#[from] io::Error),
}

/// Framing violations detected by an IPC channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first frame on a connection was not the hello frame.
    #[error("first frame must be hello, got message type {message_type:#x}")]
    MissingHello {
        /// Type of the offending frame
        message_type: u32,
    },

    /// The hello frame did not carry a process id.
    #[error("hello frame does not carry a process id")]
    MalformedHello,

    /// A frame header declared a payload larger than the channel accepts.
    #[error("declared payload of {declared} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Payload size found in the header
        declared: usize,
        /// Largest accepted frame size
        limit: usize,
    },
}

/// Reasons an IPC channel tears down.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The underlying pipe reported an error.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent bytes that violate the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The channel has no live connection to send on.
    #[error("channel is not connected")]
    NotConnected,

    /// The channel was closed locally.
    #[error("channel is closed")]
    Closed,
}

/// Failures while reading typed fields out of a pickle payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickleError {
    /// A read would run past the end of the payload.
    #[error("read of {wanted} bytes exceeds the {remaining} bytes left in the payload")]
    OutOfBounds {
        /// Bytes the read needed
        wanted: usize,
        /// Bytes still available
        remaining: usize,
    },

    /// A length prefix was negative.
    #[error("negative length prefix")]
    NegativeLength,

    /// A string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A wide string field was not valid UTF-16.
    #[error("wide string field is not valid UTF-16")]
    InvalidUtf16,
}
