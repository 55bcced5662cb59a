use crate::error::ChannelError;
use crate::ipc::{IpcChannel, IpcMessage};

/// Receives what arrives on an [`IpcChannel`]. Called on the channel's
/// thread.
pub trait IpcListener {
    /// A message arrived. Returns whether it was handled.
    fn on_message_received(&self, channel: &IpcChannel, message: &IpcMessage) -> bool;

    /// The peer's hello arrived; fires once per connection, before any
    /// message of that connection is delivered.
    fn on_channel_connected(&self, _channel: &IpcChannel, _peer_pid: i32) {}

    /// The connection was torn down. Queued outgoing messages are dropped.
    fn on_channel_error(&self, _channel: &IpcChannel, _error: &ChannelError) {}
}
