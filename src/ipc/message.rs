//! IPC frames: a fixed header followed by a pickled payload.
//!
//! Header layout, little-endian, 16 bytes:
//!
//! | offset | field          | type  |
//! |--------|----------------|-------|
//! | 0      | payload size   | `u32` |
//! | 4      | routing id     | `i32` |
//! | 8      | message type   | `u32` |
//! | 12     | flags          | `u32` |
//!
//! The low byte of `flags` holds the [`Priority`]; the upper 24 bits carry a
//! process-local reference number used to follow a message in traces.

use crate::ipc::pickle::{Pickle, PickleIterator};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Type of the handshake frame; above every ordinary message type.
pub const HELLO_MESSAGE_TYPE: u32 = u16::MAX as u32;

/// Routing id of a message that has no route yet.
pub const MSG_ROUTING_NONE: i32 = -2;

/// Routing id of control messages not aimed at a particular route.
pub const MSG_ROUTING_CONTROL: i32 = i32::MAX;

/// Largest frame, header included, a channel accepts.
pub const MAXIMUM_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

const ROUTING_OFFSET: usize = 4;
const TYPE_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 12;
const PRIORITY_MASK: u32 = 0xff;

static NEXT_REFERENCE: AtomicU32 = AtomicU32::new(0);

/// Delivery priority recorded in a frame's flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Priority {
    fn from_flags(flags: u32) -> Option<Self> {
        match flags & PRIORITY_MASK {
            1 => Some(Priority::Low),
            2 => Some(Priority::Normal),
            3 => Some(Priority::High),
            _ => None,
        }
    }
}

// 24-bit trace reference in the upper bits: 10 bits of the pid above 14
// bits of a wrapping per-process counter.
fn reference_number_upper_24() -> u32 {
    let pid = std::process::id() & 0x3ff;
    let count = NEXT_REFERENCE.fetch_add(1, Ordering::Relaxed) & 0x3fff;
    ((pid << 14) | count) << 8
}

/// One IPC message: routing id, type, flags and a pickled payload.
///
/// # Example
/// ```ignore
/// let mut message = IpcMessage::new(MSG_ROUTING_CONTROL, 7, Priority::Normal);
/// message.pickle_mut().write_string("ping");
/// channel.send(message)?;
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pickle: Pickle,
}

impl IpcMessage {
    /// An empty message; write the payload through [`pickle_mut`](Self::pickle_mut).
    ///
    /// # Arguments
    /// * `routing_id` - Destination route, or [`MSG_ROUTING_CONTROL`]
    /// * `message_type` - Application type, below [`HELLO_MESSAGE_TYPE`]
    /// * `priority` - Stored in the low byte of the flags
    pub fn new(routing_id: i32, message_type: u32, priority: Priority) -> Self {
        let mut pickle = Pickle::with_header_size(HEADER_SIZE);

        let header = pickle.header_mut();
        header[ROUTING_OFFSET..TYPE_OFFSET].copy_from_slice(&routing_id.to_le_bytes());
        header[TYPE_OFFSET..FLAGS_OFFSET].copy_from_slice(&message_type.to_le_bytes());
        let flags = priority as u32 | reference_number_upper_24();
        header[FLAGS_OFFSET..HEADER_SIZE].copy_from_slice(&flags.to_le_bytes());

        Self { pickle }
    }

    /// The handshake frame announcing `pid`.
    pub fn hello(pid: i32) -> Self {
        let mut message = Self::new(MSG_ROUTING_NONE, HELLO_MESSAGE_TYPE, Priority::Normal);
        message.pickle.write_i32(pid);
        message
    }

    /// End offset of the first complete frame at the start of `bytes`.
    pub fn find_next(bytes: &[u8]) -> Option<usize> {
        Pickle::find_next(HEADER_SIZE, bytes)
    }

    /// Total frame size (header included) declared by the header at the
    /// start of `bytes`, once the size field has arrived.
    pub fn declared_frame_size(bytes: &[u8]) -> Option<usize> {
        Pickle::declared_payload_size(bytes).map(|payload| payload + HEADER_SIZE)
    }

    /// Parses exactly one frame.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        Pickle::from_bytes(frame.to_vec(), HEADER_SIZE).map(|pickle| Self { pickle })
    }

    fn header_field(&self, offset: usize) -> [u8; 4] {
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.pickle.header()[offset..offset + 4]);
        field
    }

    pub fn routing_id(&self) -> i32 {
        i32::from_le_bytes(self.header_field(ROUTING_OFFSET))
    }

    pub fn message_type(&self) -> u32 {
        u32::from_le_bytes(self.header_field(TYPE_OFFSET))
    }

    pub fn flags(&self) -> u32 {
        u32::from_le_bytes(self.header_field(FLAGS_OFFSET))
    }

    /// Priority from the flags; `None` if the sender used an unknown value.
    pub fn priority(&self) -> Option<Priority> {
        Priority::from_flags(self.flags())
    }

    /// The 24-bit trace reference number.
    pub fn reference_number(&self) -> u32 {
        self.flags() >> 8
    }

    pub fn is_hello(&self) -> bool {
        self.message_type() == HELLO_MESSAGE_TYPE
    }

    pub fn payload(&self) -> &[u8] {
        self.pickle.payload()
    }

    pub fn pickle_mut(&mut self) -> &mut Pickle {
        &mut self.pickle
    }

    pub fn reader(&self) -> PickleIterator<'_> {
        self.pickle.reader()
    }

    /// The whole frame as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.pickle.as_bytes()
    }

    /// Frame size, header included.
    pub fn size(&self) -> usize {
        self.as_bytes().len()
    }
}

impl fmt::Debug for IpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcMessage")
            .field("routing_id", &self.routing_id())
            .field("message_type", &self.message_type())
            .field("priority", &self.priority())
            .field("payload_size", &self.payload().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_survive_framing() {
        let mut message = IpcMessage::new(42, 7, Priority::High);
        message.pickle_mut().write_string("payload");

        let frame = message.as_bytes();
        assert_eq!(IpcMessage::find_next(frame), Some(frame.len()));
        assert_eq!(IpcMessage::declared_frame_size(frame), Some(frame.len()));

        let parsed = IpcMessage::from_frame(frame).expect("complete frame");
        assert_eq!(parsed.routing_id(), 42);
        assert_eq!(parsed.message_type(), 7);
        assert_eq!(parsed.priority(), Some(Priority::High));
        assert_eq!(parsed.reader().read_string().as_deref(), Ok("payload"));
        assert_eq!(parsed.flags(), message.flags());
    }

    #[test]
    fn flags_carry_priority_and_reference() {
        let first = IpcMessage::new(MSG_ROUTING_CONTROL, 1, Priority::Low);
        let second = IpcMessage::new(MSG_ROUTING_CONTROL, 1, Priority::Low);

        assert_eq!(first.flags() & 0xff, 1);
        assert_ne!(first.reference_number(), second.reference_number());
        assert_eq!(first.reference_number() >> 14, std::process::id() & 0x3ff);
    }

    #[test]
    fn hello_carries_pid() {
        let hello = IpcMessage::hello(1234);
        assert!(hello.is_hello());
        assert_eq!(hello.routing_id(), MSG_ROUTING_NONE);
        assert_eq!(hello.reader().read_i32(), Ok(1234));
    }

    #[test]
    fn partial_frames_are_not_found() {
        let message = IpcMessage::hello(1);
        let frame = message.as_bytes();

        assert_eq!(IpcMessage::find_next(&frame[..HEADER_SIZE - 1]), None);
        assert_eq!(IpcMessage::find_next(&frame[..frame.len() - 1]), None);
        assert!(IpcMessage::from_frame(&frame[..frame.len() - 1]).is_none());
    }
}
