//! Pipe client: one connection to a named endpoint.
//!
//! Connecting is synchronous. Once connected the client keeps a read
//! outstanding at all times; a failed connection is closed and reported,
//! and never re-established automatically.

use crate::error::LoopError;
use crate::net::pipe::{PipeConnection, io_pump};
use crate::net::socket::connect_to;
use crate::reactor::{IoContext, IoHandler, IoOperation, PumpKind};
use crate::runtime::MessageLoop;

use std::cell::Cell;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};

/// Receives client-side transport events. Called on the loop's thread.
pub trait PipeClientDelegate {
    /// The connection attempt finished.
    fn on_pipe_client_connect(&self, result: io::Result<()>);

    /// Bytes arrived from the server.
    fn on_pipe_client_read_data(&self, data: &[u8]);

    /// A write to the server finished.
    fn on_pipe_client_write_data(&self, bytes: usize);

    /// The connection failed and was closed.
    fn on_pipe_client_error(&self, error: io::Error);
}

struct ClientShared {
    path: PathBuf,
    message_loop: Rc<MessageLoop>,
    delegate: Weak<dyn PipeClientDelegate>,
    connection: PipeConnection,
    connected: Cell<bool>,
    this: Weak<ClientShared>,
    thread: ThreadId,
}

impl ClientShared {
    fn notify<F: FnOnce(&dyn PipeClientDelegate)>(&self, f: F) {
        if let Some(delegate) = self.delegate.upgrade() {
            f(&*delegate);
        }
    }

    fn read(&self) {
        if !self.connection.is_open() {
            return;
        }

        let result = io_pump(&self.message_loop).and_then(|pump| self.connection.start_read(pump));
        if let Err(err) = result {
            log::error!("read on {} failed to start: {}", self.path.display(), err);
            self.handle_error(err);
        }
    }

    fn handle_error(&self, err: io::Error) {
        if self.connection.is_closing() {
            return;
        }

        log::debug!("pipe client on {} failed: {}", self.path.display(), err);
        self.close();
        self.notify(|delegate| delegate.on_pipe_client_error(err));
    }

    fn close(&self) {
        self.connected.set(false);

        match io_pump(&self.message_loop) {
            Ok(pump) => self.connection.close(pump, self),
            Err(err) => log::error!("cannot close pipe client: {err}"),
        }
    }
}

impl IoHandler for ClientShared {
    fn on_io_completed(&self, context: &IoContext, result: io::Result<usize>) {
        if self.connection.is_closing() {
            return;
        }

        match (context.operation(), result) {
            (IoOperation::Read, Ok(bytes)) => {
                let data = context.data(bytes).to_vec();
                self.notify(|delegate| delegate.on_pipe_client_read_data(&data));
                self.read();
            }
            (IoOperation::Write, Ok(bytes)) => {
                self.notify(|delegate| delegate.on_pipe_client_write_data(bytes));
            }
            (IoOperation::Accept, Ok(_)) => {
                debug_assert!(false, "pipe client never accepts");
            }
            (_, Err(err)) => self.handle_error(err),
        }
    }
}

/// Client end of a named pipe endpoint.
///
/// Must be created, used and dropped on the thread of an I/O message loop.
/// A closed client cannot reconnect; create a new one instead.
pub struct PipeClient {
    shared: Rc<ClientShared>,
}

impl PipeClient {
    /// Creates a client for `path` on the current thread's I/O loop.
    ///
    /// # Arguments
    /// * `path` - Filesystem path of the server's endpoint
    /// * `delegate` - Receives transport events; held weakly
    ///
    /// # Errors
    /// [`LoopError::NoCurrentLoop`] or [`LoopError::WrongPumpKind`] unless
    /// the calling thread runs an I/O message loop.
    pub fn new(
        path: impl AsRef<Path>,
        delegate: Weak<dyn PipeClientDelegate>,
    ) -> Result<Self, LoopError> {
        let message_loop = MessageLoop::current().ok_or(LoopError::NoCurrentLoop)?;
        if message_loop.pump_kind() != PumpKind::Io {
            return Err(LoopError::WrongPumpKind {
                expected: PumpKind::Io,
                actual: message_loop.pump_kind(),
            });
        }

        let path = path.as_ref().to_path_buf();
        let shared = Rc::new_cyclic(|this| ClientShared {
            path,
            message_loop,
            delegate,
            connection: PipeConnection::new(false),
            connected: Cell::new(false),
            this: this.clone(),
            thread: thread::current().id(),
        });

        Ok(Self { shared })
    }

    /// Connects to the server, starts reading and notifies the delegate.
    ///
    /// Failures are returned as well as reported through
    /// [`PipeClientDelegate::on_pipe_client_connect`].
    ///
    /// # Example
    /// ```ignore
    /// let client = PipeClient::new(&path, Rc::downgrade(&delegate))?;
    /// client.connect()?;
    /// client.send(b"ping")?;
    /// ```
    pub fn connect(&self) -> io::Result<()> {
        self.assert_on_thread();

        if self.shared.connected.get() {
            return Ok(());
        }
        if self.shared.connection.is_closing() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pipe client was closed",
            ));
        }

        let result = self.try_connect();
        match &result {
            Ok(()) => {
                self.shared.connected.set(true);
                log::debug!("connected to {}", self.shared.path.display());
                self.shared
                    .notify(|delegate| delegate.on_pipe_client_connect(Ok(())));
                self.shared.read();
            }
            Err(err) => {
                log::error!("connect to {} failed: {}", self.shared.path.display(), err);
                let reported = io::Error::new(err.kind(), err.to_string());
                self.shared
                    .notify(|delegate| delegate.on_pipe_client_connect(Err(reported)));
            }
        }

        result
    }

    fn try_connect(&self) -> io::Result<()> {
        let pump = io_pump(&self.shared.message_loop)?;
        let fd = connect_to(&self.shared.path)?;

        let handler: Weak<dyn IoHandler> = self.shared.this.clone();
        self.shared.connection.attach(pump, fd, handler)
    }

    /// Writes `data` to the server.
    ///
    /// At most [`IO_BUFFER_SIZE`](crate::net::IO_BUFFER_SIZE) bytes, and only
    /// once the previous write has completed.
    ///
    /// # Errors
    /// `NotConnected` before `connect` or after `close`, `InvalidInput` for
    /// an oversized buffer and `WouldBlock` while a write is in flight.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        self.assert_on_thread();

        if !self.shared.connected.get() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pipe client is not connected",
            ));
        }

        let pump = io_pump(&self.shared.message_loop)?;
        self.shared.connection.write(pump, data)
    }

    /// Cancels outstanding operations and closes the connection, blocking
    /// until every cancelled completion has been observed.
    pub fn close(&self) {
        self.assert_on_thread();
        self.shared.close();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.get()
    }

    /// Whether a read or write is still outstanding.
    pub fn has_pending_io(&self) -> bool {
        self.shared.connection.has_pending()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    #[cfg(test)]
    pub(crate) fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.shared.connection.raw_fd()
    }

    fn assert_on_thread(&self) {
        debug_assert_eq!(
            self.shared.thread,
            thread::current().id(),
            "pipe client used off its thread"
        );
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        self.shared.close();
    }
}
