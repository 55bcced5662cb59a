//! Per-connection state shared by pipe servers and clients.
//!
//! A [`PipeConnection`] owns one descriptor and one operation context per
//! direction (plus an accept context on server slots). It enforces the
//! single-outstanding-operation rule and implements the blocking close:
//! cancel everything, then keep waiting on the I/O pump until every
//! cancelled completion has been handed back.

use crate::net::IO_BUFFER_SIZE;
use crate::reactor::{IoContext, IoHandler, IoOperation, IoPump};
use crate::runtime::MessageLoop;

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

pub(crate) fn io_pump(message_loop: &MessageLoop) -> io::Result<&IoPump> {
    message_loop
        .io_pump()
        .ok_or_else(|| io::Error::other("message loop has no I/O pump"))
}

pub(crate) struct PipeConnection {
    fd: RefCell<Option<OwnedFd>>,
    accept: Option<Rc<IoContext>>,
    read: Rc<IoContext>,
    write: Rc<IoContext>,
    closing: Cell<bool>,
}

impl PipeConnection {
    /// A connection with read and write contexts, and an accept context
    /// when `accepting`.
    pub(crate) fn new(accepting: bool) -> Self {
        Self {
            fd: RefCell::new(None),
            accept: accepting.then(|| IoContext::new(IoOperation::Accept, 0)),
            read: IoContext::new(IoOperation::Read, IO_BUFFER_SIZE),
            write: IoContext::new(IoOperation::Write, IO_BUFFER_SIZE),
            closing: Cell::new(false),
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd.borrow().as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.fd.borrow().is_some() && !self.closing.get()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.get()
    }

    /// Installs `fd` and routes its completions to `handler`, releasing any
    /// previous descriptor. Nothing may be pending on the previous one.
    pub(crate) fn attach(
        &self,
        pump: &IoPump,
        fd: OwnedFd,
        handler: Weak<dyn IoHandler>,
    ) -> io::Result<()> {
        debug_assert!(!self.has_pending(), "descriptor swapped with operations in flight");

        if let Some(previous) = self.fd.borrow_mut().take() {
            pump.unregister_io_handler(previous.as_raw_fd());
        }

        pump.register_io_handler(fd.as_raw_fd(), handler)?;
        *self.fd.borrow_mut() = Some(fd);
        Ok(())
    }

    fn open_fd(&self) -> io::Result<RawFd> {
        if self.closing.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "pipe is closing"));
        }

        self.raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe is not open"))
    }

    pub(crate) fn start_accept(&self, pump: &IoPump) -> io::Result<()> {
        let fd = self.open_fd()?;
        let accept = self
            .accept
            .as_ref()
            .ok_or_else(|| io::Error::other("connection cannot accept"))?;

        pump.start_accept(fd, accept)
    }

    /// Issues the next read unless one is already pending.
    pub(crate) fn start_read(&self, pump: &IoPump) -> io::Result<()> {
        let fd = self.open_fd()?;
        if self.read.is_pending() {
            return Ok(());
        }

        pump.start_read(fd, &self.read)
    }

    /// Issues a write of `data`.
    ///
    /// Fails with `InvalidInput` above [`IO_BUFFER_SIZE`] and with
    /// `WouldBlock` while the previous write is still pending.
    pub(crate) fn write(&self, pump: &IoPump, data: &[u8]) -> io::Result<()> {
        let fd = self.open_fd()?;

        if data.len() > IO_BUFFER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {} bytes exceeds {IO_BUFFER_SIZE} bytes", data.len()),
            ));
        }

        if self.write.is_pending() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "a write is already pending",
            ));
        }

        self.write.fill(data)?;
        pump.start_write(fd, &self.write)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.read.is_pending()
            || self.write.is_pending()
            || self.accept.as_ref().is_some_and(|accept| accept.is_pending())
    }

    /// Cancels pending operations, waits until each cancelled completion was
    /// delivered to `owner`, then closes the descriptor.
    ///
    /// Completions that reach `owner` while this runs find
    /// [`is_closing`](Self::is_closing) set and must be ignored.
    pub(crate) fn close(&self, pump: &IoPump, owner: &dyn IoHandler) {
        self.closing.set(true);

        let Some(fd) = self.fd.borrow_mut().take() else {
            return;
        };
        let raw = fd.as_raw_fd();

        pump.cancel_io(raw);
        while self.has_pending() {
            pump.wait_for_io_completion(None, Some(owner));
        }

        pump.unregister_io_handler(raw);
        drop(fd);
    }
}
