//! Pipe server: a fixed number of accept slots on one named endpoint.
//!
//! Each slot waits for a client, then turns into that client's connection.
//! Reads are continuous: a new read is issued as soon as the previous one
//! has been handed to the delegate. When a connection fails the slot is
//! closed and, with `auto_supplement`, a fresh accept slot replaces it so the
//! number of instances stays constant.

use crate::error::LoopError;
use crate::net::pipe::{PipeConnection, io_pump};
use crate::net::socket::bind_listener;
use crate::reactor::{IoContext, IoHandler, IoOperation, PumpKind};
use crate::runtime::MessageLoop;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};

/// Identifies one connection slot of a [`PipeServer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(u64);

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Receives server-side transport events. Called on the loop's thread.
pub trait PipeServerDelegate {
    /// An accept slot completed, successfully or not.
    fn on_pipe_server_accept(&self, key: ClientKey, result: io::Result<()>);

    /// Bytes arrived from a client.
    fn on_pipe_server_read_data(&self, key: ClientKey, data: &[u8]);

    /// A write to a client finished.
    fn on_pipe_server_write_data(&self, key: ClientKey, bytes: usize);

    /// A connection failed and was closed.
    fn on_pipe_server_error(&self, key: ClientKey, error: io::Error);
}

/// Pipe server configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeServerOptions {
    /// Number of accept slots created by `start`.
    pub max_instances: usize,

    /// Whether a failed connection is replaced by a fresh accept slot.
    pub auto_supplement: bool,
}

impl Default for PipeServerOptions {
    fn default() -> Self {
        Self {
            max_instances: 1,
            auto_supplement: true,
        }
    }
}

struct ClientInfo {
    key: ClientKey,
    server: Weak<ServerShared>,
    connection: PipeConnection,
    connected: Cell<bool>,
}

impl IoHandler for ClientInfo {
    fn on_io_completed(&self, context: &IoContext, result: io::Result<usize>) {
        if self.connection.is_closing() {
            return;
        }

        let Some(server) = self.server.upgrade() else {
            return;
        };

        match context.operation() {
            IoOperation::Accept => server.on_accept(self, context, result),
            IoOperation::Read => server.on_read(self, context, result),
            IoOperation::Write => server.on_write(self, result),
        }
    }
}

struct ServerShared {
    path: PathBuf,
    options: PipeServerOptions,
    message_loop: Rc<MessageLoop>,
    delegate: Weak<dyn PipeServerDelegate>,
    listener: RefCell<Option<OwnedFd>>,
    clients: RefCell<BTreeMap<ClientKey, Rc<ClientInfo>>>,
    next_key: Cell<u64>,
    started: Cell<bool>,
    stopped: Cell<bool>,
    thread: ThreadId,
}

impl ServerShared {
    fn create_instance(self: &Rc<Self>) -> io::Result<ClientKey> {
        let pump = io_pump(&self.message_loop)?;

        let listener = self
            .listener
            .borrow()
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not listening"))?
            .try_clone()?;

        let key = ClientKey(self.next_key.get());
        self.next_key.set(key.0 + 1);

        let client = Rc::new(ClientInfo {
            key,
            server: Rc::downgrade(self),
            connection: PipeConnection::new(true),
            connected: Cell::new(false),
        });

        let handler: Rc<dyn IoHandler> = client.clone();
        client
            .connection
            .attach(pump, listener, Rc::downgrade(&handler))?;
        if let Err(err) = client.connection.start_accept(pump) {
            client.connection.close(pump, &*client);
            return Err(err);
        }

        self.clients.borrow_mut().insert(key, client);
        log::trace!("{} waiting for a connection on {}", key, self.path.display());

        Ok(key)
    }

    fn client(&self, key: ClientKey) -> Option<Rc<ClientInfo>> {
        self.clients.borrow().get(&key).cloned()
    }

    fn notify<F: FnOnce(&dyn PipeServerDelegate)>(&self, f: F) {
        if let Some(delegate) = self.delegate.upgrade() {
            f(&*delegate);
        }
    }

    fn on_accept(self: &Rc<Self>, client: &ClientInfo, context: &IoContext, result: io::Result<usize>) {
        let accepted = result.and_then(|_| {
            context
                .take_accepted()
                .ok_or_else(|| io::Error::other("accept completed without a connection"))
        });

        let connection = match accepted {
            Ok(connection) => connection,
            Err(err) => {
                log::error!("accept on {} failed: {}", self.path.display(), err);
                self.replace_slot(client);
                self.notify(|delegate| delegate.on_pipe_server_accept(client.key, Err(err)));
                return;
            }
        };

        if let Err(err) = self.attach_connection(client, connection) {
            self.handle_error(client, err);
            return;
        }

        client.connected.set(true);
        log::debug!("{} connected on {}", client.key, self.path.display());
        self.notify(|delegate| delegate.on_pipe_server_accept(client.key, Ok(())));

        self.read(client);
    }

    fn attach_connection(&self, client: &ClientInfo, connection: OwnedFd) -> io::Result<()> {
        let pump = io_pump(&self.message_loop)?;
        let Some(handler) = self.client(client.key) else {
            return Err(io::Error::other("client slot is gone"));
        };

        let handler: Rc<dyn IoHandler> = handler;
        client
            .connection
            .attach(pump, connection, Rc::downgrade(&handler))
    }

    fn read(self: &Rc<Self>, client: &ClientInfo) {
        if !client.connection.is_open() {
            return;
        }

        let result = io_pump(&self.message_loop).and_then(|pump| client.connection.start_read(pump));
        if let Err(err) = result {
            log::error!("read on {} failed to start: {}", client.key, err);
            self.handle_error(client, err);
        }
    }

    fn on_read(self: &Rc<Self>, client: &ClientInfo, context: &IoContext, result: io::Result<usize>) {
        match result {
            Ok(bytes) => {
                let data = context.data(bytes).to_vec();
                self.notify(|delegate| delegate.on_pipe_server_read_data(client.key, &data));
                self.read(client);
            }
            Err(err) => self.handle_error(client, err),
        }
    }

    fn on_write(self: &Rc<Self>, client: &ClientInfo, result: io::Result<usize>) {
        match result {
            Ok(bytes) => {
                self.notify(|delegate| delegate.on_pipe_server_write_data(client.key, bytes))
            }
            Err(err) => self.handle_error(client, err),
        }
    }

    // Closes the slot, replaces it if configured to, then reports `err`.
    fn handle_error(self: &Rc<Self>, client: &ClientInfo, err: io::Error) {
        if client.connection.is_closing() {
            return;
        }

        log::debug!("{} on {} failed: {}", client.key, self.path.display(), err);
        self.replace_slot(client);
        self.notify(|delegate| delegate.on_pipe_server_error(client.key, err));
    }

    fn replace_slot(self: &Rc<Self>, client: &ClientInfo) {
        self.close_client(client);

        if self.stopped.get() || !self.options.auto_supplement {
            return;
        }

        if let Err(err) = self.create_instance() {
            log::error!("failed to replace accept slot on {}: {}", self.path.display(), err);
        }
    }

    fn close_client(&self, client: &ClientInfo) {
        let removed = self.clients.borrow_mut().remove(&client.key);
        client.connected.set(false);

        match io_pump(&self.message_loop) {
            Ok(pump) => client.connection.close(pump, client),
            Err(err) => log::error!("cannot close {}: {}", client.key, err),
        }

        drop(removed);
    }
}

/// Server end of a named pipe endpoint.
///
/// Must be created, used and dropped on the thread of an I/O message loop.
///
/// # Example
/// ```ignore
/// let server = PipeServer::new(&path, Rc::downgrade(&delegate), PipeServerOptions::default())?;
/// server.start()?;
/// ```
pub struct PipeServer {
    shared: Rc<ServerShared>,
}

impl PipeServer {
    /// Creates a server for `path` on the current thread's I/O loop.
    ///
    /// Nothing is bound until [`start`](Self::start).
    ///
    /// # Arguments
    /// * `path` - Filesystem path of the endpoint
    /// * `delegate` - Receives transport events; held weakly
    /// * `options` - Slot count and replacement policy
    ///
    /// # Errors
    /// [`LoopError::NoCurrentLoop`] or [`LoopError::WrongPumpKind`] unless
    /// the calling thread runs an I/O message loop.
    pub fn new(
        path: impl AsRef<Path>,
        delegate: Weak<dyn PipeServerDelegate>,
        options: PipeServerOptions,
    ) -> Result<Self, LoopError> {
        let message_loop = MessageLoop::current().ok_or(LoopError::NoCurrentLoop)?;
        if message_loop.pump_kind() != PumpKind::Io {
            return Err(LoopError::WrongPumpKind {
                expected: PumpKind::Io,
                actual: message_loop.pump_kind(),
            });
        }

        Ok(Self {
            shared: Rc::new(ServerShared {
                path: path.as_ref().to_path_buf(),
                options,
                message_loop,
                delegate,
                listener: RefCell::new(None),
                clients: RefCell::new(BTreeMap::new()),
                next_key: Cell::new(0),
                started: Cell::new(false),
                stopped: Cell::new(false),
                thread: thread::current().id(),
            }),
        })
    }

    /// Binds the endpoint and creates `max_instances` accept slots.
    ///
    /// Calling it again while started does nothing.
    ///
    /// # Errors
    /// Binding fails if `path` is taken by a live server or its directory
    /// does not exist.
    pub fn start(&self) -> io::Result<()> {
        self.assert_on_thread();

        if self.shared.started.replace(true) {
            return Ok(());
        }
        self.shared.stopped.set(false);

        let listener = bind_listener(&self.shared.path)?;
        *self.shared.listener.borrow_mut() = Some(listener);

        for _ in 0..self.shared.options.max_instances.max(1) {
            self.shared.create_instance()?;
        }

        log::debug!(
            "pipe server listening on {} with {} instance(s)",
            self.shared.path.display(),
            self.shared.options.max_instances.max(1)
        );
        Ok(())
    }

    /// Writes `data` to the client behind `key`.
    ///
    /// At most [`IO_BUFFER_SIZE`](crate::net::IO_BUFFER_SIZE) bytes, and only
    /// once the previous write to that client has completed. Completion is
    /// reported through [`PipeServerDelegate::on_pipe_server_write_data`].
    ///
    /// # Arguments
    /// * `key` - Slot received in `on_pipe_server_accept`
    /// * `data` - Bytes to write
    ///
    /// # Errors
    /// `NotConnected` for an unknown or accepting slot, `InvalidInput` for an
    /// oversized buffer and `WouldBlock` while a write is in flight.
    ///
    /// # Example
    /// ```ignore
    /// server.send(key, b"pong")?;
    /// ```
    pub fn send(&self, key: ClientKey, data: &[u8]) -> io::Result<()> {
        self.assert_on_thread();

        let client = self
            .shared
            .client(key)
            .filter(|client| client.connected.get())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, format!("{key} is not connected")))?;

        let pump = io_pump(&self.shared.message_loop)?;
        client.connection.write(pump, data)
    }

    /// Closes the connection behind `key`. With `auto_supplement` a fresh
    /// accept slot takes its place. The delegate is not notified.
    pub fn close_client(&self, key: ClientKey) {
        self.assert_on_thread();

        if let Some(client) = self.shared.client(key) {
            self.shared.replace_slot(&client);
        }
    }

    /// Closes every slot and removes the endpoint from the filesystem.
    pub fn stop(&self) {
        self.assert_on_thread();

        if self.shared.stopped.replace(true) || !self.shared.started.replace(false) {
            return;
        }

        let clients: Vec<_> = self.shared.clients.borrow().values().cloned().collect();
        for client in clients {
            self.shared.close_client(&client);
        }

        self.shared.listener.borrow_mut().take();
        if let Err(err) = std::fs::remove_file(&self.shared.path) {
            log::debug!("could not remove {}: {}", self.shared.path.display(), err);
        }

        log::debug!("pipe server on {} stopped", self.shared.path.display());
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .borrow()
            .values()
            .filter(|client| client.connected.get())
            .count()
    }

    /// Number of slots, connected or still accepting.
    pub fn instance_count(&self) -> usize {
        self.shared.clients.borrow().len()
    }

    pub fn is_connected(&self, key: ClientKey) -> bool {
        self.shared
            .client(key)
            .is_some_and(|client| client.connected.get())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn assert_on_thread(&self) {
        debug_assert_eq!(
            self.shared.thread,
            thread::current().id(),
            "pipe server used off its thread"
        );
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.stop();
    }
}
