//! IPC channel: framed messages over a named pipe endpoint.
//!
//! Each side queues a hello frame carrying its pid as soon as a connection
//! is established, and treats the peer as connected only once the peer's
//! hello has arrived; any other first frame is a protocol violation.
//!
//! Outgoing messages are written one at a time, in chunks of at most
//! [`IO_BUFFER_SIZE`] bytes; the next chunk goes out when the previous write
//! completes. Incoming bytes accumulate until a complete frame is present.

use crate::error::{ChannelError, LoopError, ProtocolError};
use crate::ipc::IpcListener;
use crate::ipc::message::{IpcMessage, MAXIMUM_MESSAGE_SIZE};
use crate::net::{
    ClientKey, IO_BUFFER_SIZE, PipeClient, PipeClientDelegate, PipeServer, PipeServerDelegate,
    PipeServerOptions,
};

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

/// Which end of the pipe a channel owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    Server,
    Client,
}

/// Channel configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    pub mode: ChannelMode,

    /// Accept slots of a server channel.
    pub max_instances: usize,

    /// Whether a server channel re-arms its accept slot after a connection
    /// fails, so a new peer can connect.
    pub auto_supplement: bool,
}

impl ChannelOptions {
    /// One accept slot, re-armed after every failed connection.
    pub fn server() -> Self {
        Self {
            mode: ChannelMode::Server,
            max_instances: 1,
            auto_supplement: true,
        }
    }

    pub fn client() -> Self {
        Self {
            mode: ChannelMode::Client,
            ..Self::server()
        }
    }
}

enum Endpoint {
    Server(PipeServer),
    Client(PipeClient),
}

struct OutgoingMessage {
    message: IpcMessage,
    offset: usize,
}

struct ChannelInner {
    name: PathBuf,
    mode: ChannelMode,
    listener: Weak<dyn IpcListener>,
    endpoint: OnceCell<Endpoint>,
    client_key: Cell<Option<ClientKey>>,
    peer_pid: Cell<Option<i32>>,
    output_queue: RefCell<VecDeque<OutgoingMessage>>,
    input_buffer: RefCell<Vec<u8>>,
    closed: Cell<bool>,
    this: Weak<ChannelInner>,
}

/// A framed message channel over a named pipe.
///
/// Cloning yields another handle to the same channel.
///
/// # Example
/// ```ignore
/// let channel = IpcChannel::new(&path, ChannelOptions::client(), Rc::downgrade(&listener))?;
/// channel.connect()?;
/// channel.send(IpcMessage::new(MSG_ROUTING_CONTROL, 1, Priority::Normal))?;
/// ```
#[derive(Clone)]
pub struct IpcChannel {
    inner: Rc<ChannelInner>,
}

impl IpcChannel {
    /// Creates a channel on the current thread's I/O loop.
    ///
    /// Nothing touches the filesystem until [`connect`](Self::connect).
    ///
    /// # Arguments
    /// * `name` - Path of the pipe endpoint
    /// * `options` - Server or client end, plus the server's slot policy
    /// * `listener` - Receives channel events; held weakly
    ///
    /// # Errors
    /// [`LoopError::NoCurrentLoop`] or [`LoopError::WrongPumpKind`] unless
    /// the calling thread runs an I/O message loop.
    pub fn new(
        name: impl AsRef<Path>,
        options: ChannelOptions,
        listener: Weak<dyn IpcListener>,
    ) -> Result<Self, LoopError> {
        let name = name.as_ref().to_path_buf();

        let inner = Rc::new_cyclic(|this| ChannelInner {
            name: name.clone(),
            mode: options.mode,
            listener,
            endpoint: OnceCell::new(),
            client_key: Cell::new(None),
            peer_pid: Cell::new(None),
            output_queue: RefCell::new(VecDeque::new()),
            input_buffer: RefCell::new(Vec::new()),
            closed: Cell::new(false),
            this: this.clone(),
        });

        let endpoint = match options.mode {
            ChannelMode::Server => {
                let delegate: Weak<dyn PipeServerDelegate> = Rc::downgrade(&inner) as Weak<ChannelInner>;
                let server_options = PipeServerOptions {
                    max_instances: options.max_instances,
                    auto_supplement: options.auto_supplement,
                };
                Endpoint::Server(PipeServer::new(&name, delegate, server_options)?)
            }
            ChannelMode::Client => {
                let delegate: Weak<dyn PipeClientDelegate> = Rc::downgrade(&inner) as Weak<ChannelInner>;
                Endpoint::Client(PipeClient::new(&name, delegate)?)
            }
        };

        if inner.endpoint.set(endpoint).is_err() {
            debug_assert!(false, "channel endpoint installed twice");
        }

        Ok(Self { inner })
    }

    /// Starts listening (server) or connects (client).
    ///
    /// A client whose connection attempt fails also reports the error to
    /// the listener.
    pub fn connect(&self) -> Result<(), ChannelError> {
        if self.inner.closed.get() {
            return Err(ChannelError::Closed);
        }

        match self.inner.endpoint.get() {
            Some(Endpoint::Server(server)) => server.start()?,
            Some(Endpoint::Client(client)) => client.connect()?,
            None => return Err(ChannelError::NotConnected),
        }

        Ok(())
    }

    /// Queues `message` and writes it once everything before it is out.
    ///
    /// Messages queued before the peer connects are sent after the hello.
    ///
    /// # Arguments
    /// * `message` - Complete frame; at most [`MAXIMUM_MESSAGE_SIZE`] bytes
    ///
    /// # Errors
    /// [`ChannelError::Closed`] after [`close`](Self::close), a protocol
    /// error for an oversized message, and [`ChannelError::Transport`] when
    /// the write cannot be issued. The last one also tears the connection
    /// down and reaches the listener.
    ///
    /// # Example
    /// ```ignore
    /// let mut message = IpcMessage::new(MSG_ROUTING_CONTROL, 7, Priority::Normal);
    /// message.pickle_mut().write_string("ping");
    /// channel.send(message)?;
    /// ```
    pub fn send(&self, message: IpcMessage) -> Result<(), ChannelError> {
        if self.inner.closed.get() {
            return Err(ChannelError::Closed);
        }

        if message.size() > MAXIMUM_MESSAGE_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                declared: message.size(),
                limit: MAXIMUM_MESSAGE_SIZE,
            }
            .into());
        }

        self.inner
            .output_queue
            .borrow_mut()
            .push_back(OutgoingMessage { message, offset: 0 });

        if let Err(err) = self.inner.process_outgoing_messages() {
            let reported = io::Error::new(err.kind(), err.to_string());
            self.inner.on_transport_error(err);
            return Err(ChannelError::Transport(reported));
        }

        Ok(())
    }

    /// Closes the endpoint and drops queued messages. The listener is not
    /// notified.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Pid announced by the peer's hello, once it has arrived.
    pub fn peer_pid(&self) -> Option<i32> {
        self.inner.peer_pid.get()
    }

    /// Whether the peer's hello has arrived on the current connection.
    pub fn is_connected(&self) -> bool {
        self.inner.peer_pid.get().is_some()
    }

    pub fn mode(&self) -> ChannelMode {
        self.inner.mode
    }

    pub fn name(&self) -> &Path {
        &self.inner.name
    }

    /// Messages queued and not fully written yet.
    pub fn pending_message_count(&self) -> usize {
        self.inner.output_queue.borrow().len()
    }
}

impl ChannelInner {
    fn handle(&self) -> Option<IpcChannel> {
        self.this.upgrade().map(|inner| IpcChannel { inner })
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }

        match self.endpoint.get() {
            Some(Endpoint::Server(server)) => server.stop(),
            Some(Endpoint::Client(client)) => client.close(),
            None => {}
        }

        self.client_key.set(None);
        self.cleanup();
    }

    fn cleanup(&self) {
        self.output_queue.borrow_mut().clear();
        self.input_buffer.borrow_mut().clear();
        self.peer_pid.set(None);
    }

    // A connection was established: start from a clean slate and put our
    // hello ahead of anything queued meanwhile.
    fn on_connection_established(&self) {
        self.input_buffer.borrow_mut().clear();
        self.peer_pid.set(None);

        {
            let mut queue = self.output_queue.borrow_mut();
            // A partially written message belonged to the previous connection.
            queue.retain(|outgoing| outgoing.offset == 0);
            queue.push_front(OutgoingMessage {
                message: IpcMessage::hello(std::process::id() as i32),
                offset: 0,
            });
        }

        if let Err(err) = self.process_outgoing_messages() {
            log::error!("failed to send hello on {}: {}", self.name.display(), err);
            self.on_transport_error(err);
        }
    }

    fn process_outgoing_messages(&self) -> io::Result<bool> {
        let (chunk, len) = {
            let queue = self.output_queue.borrow();
            let Some(front) = queue.front() else {
                return Ok(false);
            };

            let bytes = front.message.as_bytes();
            let len = (bytes.len() - front.offset).min(IO_BUFFER_SIZE);
            (bytes[front.offset..front.offset + len].to_vec(), len)
        };

        let result = match self.endpoint.get() {
            Some(Endpoint::Server(server)) => match self.client_key.get() {
                Some(key) => server.send(key, &chunk),
                None => return Ok(false),
            },
            Some(Endpoint::Client(client)) => {
                if !client.is_connected() {
                    return Ok(false);
                }
                client.send(&chunk)
            }
            None => return Ok(false),
        };

        match result {
            Ok(()) => {
                let mut queue = self.output_queue.borrow_mut();
                if let Some(front) = queue.front_mut() {
                    front.offset += len;
                    if front.offset == front.message.size() {
                        queue.pop_front();
                    }
                }
                Ok(true)
            }
            // The previous write is still in flight; its completion resumes us.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn on_channel_read_data(&self, data: &[u8]) {
        self.input_buffer.borrow_mut().extend_from_slice(data);

        loop {
            let frame = {
                let mut buffer = self.input_buffer.borrow_mut();

                if let Some(size) = IpcMessage::declared_frame_size(&buffer)
                    && size > MAXIMUM_MESSAGE_SIZE
                {
                    drop(buffer);
                    self.on_protocol_error(ProtocolError::PayloadTooLarge {
                        declared: size,
                        limit: MAXIMUM_MESSAGE_SIZE,
                    });
                    return;
                }

                let Some(end) = IpcMessage::find_next(&buffer) else {
                    return;
                };
                buffer.drain(..end).collect::<Vec<u8>>()
            };

            let Some(message) = IpcMessage::from_frame(&frame) else {
                log::error!("dropping unparsable frame of {} bytes", frame.len());
                continue;
            };

            if !self.dispatch(message) {
                return;
            }
        }
    }

    // Returns false once the connection is gone and no further frames from
    // this read may be dispatched.
    fn dispatch(&self, message: IpcMessage) -> bool {
        if message.is_hello() {
            if self.peer_pid.get().is_some() {
                log::warn!("ignoring repeated hello on {}", self.name.display());
                return true;
            }
            return self.handle_hello_message(&message);
        }

        if self.peer_pid.get().is_none() {
            self.on_protocol_error(ProtocolError::MissingHello {
                message_type: message.message_type(),
            });
            return false;
        }

        let (Some(listener), Some(channel)) = (self.listener.upgrade(), self.handle()) else {
            return true;
        };

        if !listener.on_message_received(&channel, &message) {
            log::debug!("unhandled message {:?}", message);
        }

        !self.closed.get() && self.peer_pid.get().is_some()
    }

    fn handle_hello_message(&self, message: &IpcMessage) -> bool {
        let Ok(pid) = message.reader().read_i32() else {
            self.on_protocol_error(ProtocolError::MalformedHello);
            return false;
        };

        self.peer_pid.set(Some(pid));
        log::info!("ipc channel {} connected, peer_pid = {}", self.name.display(), pid);

        if let (Some(listener), Some(channel)) = (self.listener.upgrade(), self.handle()) {
            listener.on_channel_connected(&channel, pid);
        }

        !self.closed.get() && self.peer_pid.get().is_some()
    }

    // Drops the current connection. A server re-arms its accept slot; a
    // client stays closed.
    fn drop_connection(&self) {
        match self.endpoint.get() {
            Some(Endpoint::Server(server)) => {
                if let Some(key) = self.client_key.take() {
                    server.close_client(key);
                }
            }
            Some(Endpoint::Client(client)) => client.close(),
            None => {}
        }
    }

    fn on_protocol_error(&self, error: ProtocolError) {
        log::warn!("protocol violation on {}: {}", self.name.display(), error);

        self.drop_connection();
        self.on_channel_error(ChannelError::Protocol(error));
    }

    // A write could not be issued; the transport reported nothing itself.
    fn on_transport_error(&self, error: io::Error) {
        log::error!("write on {} failed: {}", self.name.display(), error);

        self.drop_connection();
        self.on_channel_error(ChannelError::Transport(error));
    }

    fn on_channel_error(&self, error: ChannelError) {
        log::info!(
            "ipc channel {} error: {}, peer_pid = {:?}",
            self.name.display(),
            error,
            self.peer_pid.get()
        );

        self.cleanup();

        if let (Some(listener), Some(channel)) = (self.listener.upgrade(), self.handle()) {
            listener.on_channel_error(&channel, &error);
        }
    }
}

impl PipeServerDelegate for ChannelInner {
    fn on_pipe_server_accept(&self, key: ClientKey, result: io::Result<()>) {
        match result {
            Ok(()) => {
                self.client_key.set(Some(key));
                self.on_connection_established();
            }
            Err(err) => log::error!("accept on {} failed: {}", self.name.display(), err),
        }
    }

    fn on_pipe_server_read_data(&self, key: ClientKey, data: &[u8]) {
        if self.client_key.get() == Some(key) {
            self.on_channel_read_data(data);
        }
    }

    fn on_pipe_server_write_data(&self, key: ClientKey, _bytes: usize) {
        if self.client_key.get() != Some(key) {
            return;
        }

        if let Err(err) = self.process_outgoing_messages() {
            self.on_transport_error(err);
        }
    }

    fn on_pipe_server_error(&self, key: ClientKey, error: io::Error) {
        if self.client_key.get() != Some(key) {
            return;
        }

        self.client_key.set(None);
        self.on_channel_error(ChannelError::Transport(error));
    }
}

impl PipeClientDelegate for ChannelInner {
    fn on_pipe_client_connect(&self, result: io::Result<()>) {
        match result {
            Ok(()) => self.on_connection_established(),
            Err(err) => self.on_channel_error(ChannelError::Transport(err)),
        }
    }

    fn on_pipe_client_read_data(&self, data: &[u8]) {
        self.on_channel_read_data(data);
    }

    fn on_pipe_client_write_data(&self, _bytes: usize) {
        if let Err(err) = self.process_outgoing_messages() {
            self.on_transport_error(err);
        }
    }

    fn on_pipe_client_error(&self, error: io::Error) {
        self.on_channel_error(ChannelError::Transport(error));
    }
}
