//! I/O pump: a completion-style I/O facility built on epoll.
//!
//! Owners of file descriptors register an [`IoHandler`] for each descriptor
//! and then *issue* operations ([`IoPump::start_read`],
//! [`IoPump::start_write`], [`IoPump::start_accept`]), each tracked by an
//! [`IoContext`]. When epoll reports the descriptor ready, the pump performs
//! the non-blocking syscall itself; once the operation has finished (or
//! failed) a completion record is queued and later delivered to the handler
//! through [`IoHandler::on_io_completed`], always on the loop's thread.
//!
//! Cancellation ([`IoPump::cancel_io`]) also produces completions, carrying
//! `ECANCELED`, so an owner that wants to release its buffers can block in
//! [`IoPump::wait_for_io_completion`] until every context it issued has been
//! handed back.
//!
//! Cross-thread wakeups use an `eventfd` registered under a reserved token.
//! The pump consumes that internal completion itself and never routes it to
//! a handler.

use crate::reactor::PumpDelegate;
use crate::reactor::poller::{Interest, Poller, Readiness};
use crate::time::{TimeTicks, delay_until};

use libc::{
    EAGAIN, ECANCELED, EFD_CLOEXEC, EFD_NONBLOCK, EINTR, EWOULDBLOCK, MSG_NOSIGNAL,
    SOCK_CLOEXEC, SOCK_NONBLOCK, accept4, eventfd, recv, send,
};
use std::cell::{Cell, Ref, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Token under which the wakeup eventfd is registered.
const WAKE_TOKEN: u64 = u64::MAX;

/// Receives the outcome of operations issued on a registered descriptor.
///
/// Called on the owning loop's thread only. `result` carries the number of
/// bytes transferred, or the error that ended the operation (`ECANCELED`
/// after [`IoPump::cancel_io`], `BrokenPipe` when the peer closed a read).
pub trait IoHandler {
    fn on_io_completed(&self, context: &IoContext, result: io::Result<usize>);
}

/// The kind of operation an [`IoContext`] tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOperation {
    Accept,
    Read,
    Write,
}

/// State of one in-flight operation slot.
///
/// A context is issued at most once at a time: `is_pending` is raised when
/// the operation is issued and dropped right before its completion is
/// delivered.
pub struct IoContext {
    operation: IoOperation,
    pending: Cell<bool>,
    buffer: RefCell<Box<[u8]>>,
    len: Cell<usize>,
    transferred: Cell<usize>,
    accepted: RefCell<Option<OwnedFd>>,
}

impl IoContext {
    /// Creates a context with a buffer of `capacity` bytes.
    pub fn new(operation: IoOperation, capacity: usize) -> Rc<Self> {
        Rc::new(Self {
            operation,
            pending: Cell::new(false),
            buffer: RefCell::new(vec![0u8; capacity].into_boxed_slice()),
            len: Cell::new(0),
            transferred: Cell::new(0),
            accepted: RefCell::new(None),
        })
    }

    pub fn operation(&self) -> IoOperation {
        self.operation
    }

    /// Whether an operation on this context has not been handed back yet.
    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.borrow().len()
    }

    /// Copies `data` into the buffer for the next write.
    pub fn fill(&self, data: &[u8]) -> io::Result<()> {
        if self.pending.get() {
            return Err(io::Error::other("context has an operation in flight"));
        }

        let mut buffer = self.buffer.borrow_mut();
        if data.len() > buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes exceeds the {} byte I/O buffer",
                    data.len(),
                    buffer.len()
                ),
            ));
        }

        buffer[..data.len()].copy_from_slice(data);
        self.len.set(data.len());
        self.transferred.set(0);

        Ok(())
    }

    /// First `len` bytes of the buffer, e.g. the data a read completed with.
    pub fn data(&self, len: usize) -> Ref<'_, [u8]> {
        Ref::map(self.buffer.borrow(), |buffer| &buffer[..len.min(buffer.len())])
    }

    /// Takes the connection produced by a completed accept.
    pub fn take_accepted(&self) -> Option<OwnedFd> {
        self.accepted.borrow_mut().take()
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("operation", &self.operation)
            .field("pending", &self.pending.get())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Cross-thread half of the I/O pump.
pub(crate) struct IoWaker {
    eventfd: OwnedFd,
    have_work: AtomicBool,
}

impl IoWaker {
    fn new() -> io::Result<Self> {
        let fd = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
            have_work: AtomicBool::new(false),
        })
    }

    /// Posts the internal completion unless one is already in flight.
    pub(crate) fn schedule_work(&self) {
        if self.have_work.swap(true, Ordering::AcqRel) {
            return;
        }

        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &value as *const u64 as *const _,
                size_of::<u64>(),
            )
        };

        if ret < 0 {
            self.have_work.store(false, Ordering::Release);
            log::warn!(
                "failed to wake I/O pump: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn drain(&self) {
        let mut value: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.eventfd.as_raw_fd(),
                &mut value as *mut u64 as *mut _,
                size_of::<u64>(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(EAGAIN) | Some(EINTR)) {
                log::warn!("failed to drain I/O pump wakeup: {err}");
            }
        }
    }
}

struct PendingOperation {
    context: Rc<IoContext>,
    handler: Weak<dyn IoHandler>,
}

#[derive(Default)]
struct DescriptorOperations {
    // Accept and read share the inbound slot.
    inbound: Option<PendingOperation>,
    outbound: Option<PendingOperation>,
    registered: Interest,
}

impl DescriptorOperations {
    fn wanted(&self) -> Interest {
        Interest {
            read: self.inbound.is_some(),
            write: self.outbound.is_some(),
        }
    }
}

struct IoItem {
    handler: Weak<dyn IoHandler>,
    context: Rc<IoContext>,
    result: io::Result<usize>,
}

impl IoItem {
    fn belongs_to(&self, filter: &dyn IoHandler) -> bool {
        ptr::addr_eq(self.handler.as_ptr(), filter as *const dyn IoHandler)
    }
}

enum Completion {
    Internal,
    Io(IoItem),
}

/// Pump variant that waits on epoll and dispatches I/O completions.
pub struct IoPump {
    poller: RefCell<Poller>,
    waker: Arc<IoWaker>,
    handlers: RefCell<HashMap<RawFd, Weak<dyn IoHandler>>>,
    operations: RefCell<HashMap<RawFd, DescriptorOperations>>,
    port: RefCell<VecDeque<IoItem>>,
    completed_io: RefCell<VecDeque<IoItem>>,
    readiness: RefCell<Vec<(u64, Readiness)>>,
    delayed_work_time: Cell<TimeTicks>,
}

impl IoPump {
    pub(crate) fn new() -> io::Result<Self> {
        let poller = Poller::new()?;
        let waker = Arc::new(IoWaker::new()?);

        poller.add(
            waker.eventfd.as_raw_fd(),
            WAKE_TOKEN,
            Interest {
                read: true,
                write: false,
            },
        )?;

        Ok(Self {
            poller: RefCell::new(poller),
            waker,
            handlers: RefCell::new(HashMap::new()),
            operations: RefCell::new(HashMap::new()),
            port: RefCell::new(VecDeque::new()),
            completed_io: RefCell::new(VecDeque::new()),
            readiness: RefCell::new(Vec::with_capacity(64)),
            delayed_work_time: Cell::new(TimeTicks::null()),
        })
    }

    pub(crate) fn waker(&self) -> Arc<IoWaker> {
        self.waker.clone()
    }

    /// Associates `fd` with `handler`; completions of operations issued on
    /// `fd` are delivered to it.
    pub fn register_io_handler(&self, fd: RawFd, handler: Weak<dyn IoHandler>) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid file descriptor",
            ));
        }

        self.handlers.borrow_mut().insert(fd, handler);
        Ok(())
    }

    /// Forgets the handler of `fd`, cancelling whatever is still pending on it.
    pub fn unregister_io_handler(&self, fd: RawFd) {
        self.cancel_io(fd);
        self.handlers.borrow_mut().remove(&fd);
    }

    /// Issues a read into `context`'s buffer.
    pub fn start_read(&self, fd: RawFd, context: &Rc<IoContext>) -> io::Result<()> {
        debug_assert_eq!(context.operation(), IoOperation::Read);
        self.issue(fd, context)
    }

    /// Issues a write of the bytes previously placed with [`IoContext::fill`].
    pub fn start_write(&self, fd: RawFd, context: &Rc<IoContext>) -> io::Result<()> {
        debug_assert_eq!(context.operation(), IoOperation::Write);
        self.issue(fd, context)
    }

    /// Issues an accept on listening socket `fd`.
    pub fn start_accept(&self, fd: RawFd, context: &Rc<IoContext>) -> io::Result<()> {
        debug_assert_eq!(context.operation(), IoOperation::Accept);
        self.issue(fd, context)
    }

    fn issue(&self, fd: RawFd, context: &Rc<IoContext>) -> io::Result<()> {
        debug_assert!(!context.is_pending(), "operation issued twice");
        if context.is_pending() {
            return Err(io::Error::other("operation already pending on context"));
        }

        let handler = self
            .handlers
            .borrow()
            .get(&fd)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor is not registered"))?;

        let mut operations = self.operations.borrow_mut();
        let entry = operations.entry(fd).or_default();

        let slot = match context.operation() {
            IoOperation::Accept | IoOperation::Read => &mut entry.inbound,
            IoOperation::Write => &mut entry.outbound,
        };

        if slot.is_some() {
            debug_assert!(false, "descriptor {fd} already has this direction pending");
            return Err(io::Error::other("descriptor already has an operation pending"));
        }

        *slot = Some(PendingOperation {
            context: context.clone(),
            handler,
        });

        if let Err(err) = self.sync_interest(fd, entry) {
            match context.operation() {
                IoOperation::Accept | IoOperation::Read => entry.inbound = None,
                IoOperation::Write => entry.outbound = None,
            }
            return Err(err);
        }

        context.pending.set(true);
        Ok(())
    }

    fn sync_interest(&self, fd: RawFd, entry: &mut DescriptorOperations) -> io::Result<()> {
        let wanted = entry.wanted();
        if wanted == entry.registered {
            return Ok(());
        }

        let poller = self.poller.borrow();
        if entry.registered.is_none() {
            poller.add(fd, fd as u64, wanted)?;
        } else if wanted.is_none() {
            poller.delete(fd)?;
        } else {
            poller.modify(fd, fd as u64, wanted)?;
        }

        entry.registered = wanted;
        Ok(())
    }

    /// Cancels every operation pending on `fd`.
    ///
    /// Each cancelled operation still completes, with `ECANCELED`, through
    /// the normal completion path.
    pub fn cancel_io(&self, fd: RawFd) {
        let Some(mut entry) = self.operations.borrow_mut().remove(&fd) else {
            return;
        };

        if !entry.registered.is_none() {
            if let Err(err) = self.poller.borrow().delete(fd) {
                log::debug!("epoll delete of fd {fd} failed: {err}");
            }
        }

        let mut port = self.port.borrow_mut();
        for operation in [entry.inbound.take(), entry.outbound.take()].into_iter().flatten() {
            port.push_back(IoItem {
                handler: operation.handler,
                context: operation.context,
                result: Err(io::Error::from_raw_os_error(ECANCELED)),
            });
        }
    }

    /// Number of operations issued and not yet completed by the OS.
    pub fn pending_operation_count(&self) -> usize {
        self.operations
            .borrow()
            .values()
            .map(|entry| entry.inbound.is_some() as usize + entry.outbound.is_some() as usize)
            .sum()
    }

    /// Waits up to `timeout` (forever for `None`) for one completion and
    /// delivers it.
    ///
    /// With a `filter`, completions belonging to other handlers are set
    /// aside and delivered by a later unfiltered call, ahead of anything new
    /// the poller reports. Returns `true` if a completion (including the
    /// pump's internal wakeup) was consumed.
    pub fn wait_for_io_completion(
        &self,
        timeout: Option<Duration>,
        filter: Option<&dyn IoHandler>,
    ) -> bool {
        let item = match self.match_completed_io_item(filter) {
            Some(item) => item,
            None => match self.next_completion(timeout) {
                None => return false,
                Some(Completion::Internal) => {
                    self.waker.have_work.store(false, Ordering::Release);
                    return true;
                }
                Some(Completion::Io(item)) => item,
            },
        };

        match filter {
            Some(filter) if !item.belongs_to(filter) => {
                self.completed_io.borrow_mut().push_back(item);
            }
            _ => self.deliver(item),
        }

        true
    }

    fn match_completed_io_item(&self, filter: Option<&dyn IoHandler>) -> Option<IoItem> {
        let mut completed = self.completed_io.borrow_mut();
        let index = match filter {
            None => 0,
            Some(filter) => completed.iter().position(|item| item.belongs_to(filter))?,
        };
        completed.remove(index)
    }

    fn next_completion(&self, timeout: Option<Duration>) -> Option<Completion> {
        if let Some(item) = self.port.borrow_mut().pop_front() {
            return Some(Completion::Io(item));
        }

        if self.poll(timeout) {
            return Some(Completion::Internal);
        }

        self.port.borrow_mut().pop_front().map(Completion::Io)
    }

    // Returns true if the internal wakeup fired.
    fn poll(&self, timeout: Option<Duration>) -> bool {
        let mut ready = std::mem::take(&mut *self.readiness.borrow_mut());
        ready.clear();

        let result = self.poller.borrow_mut().wait(timeout, &mut ready);
        if let Err(err) = result {
            log::error!("epoll_wait failed: {err}");
        }

        let mut woke = false;
        for &(token, readiness) in &ready {
            if token == WAKE_TOKEN {
                self.waker.drain();
                woke = true;
                continue;
            }

            self.perform(token as RawFd, readiness);
        }

        *self.readiness.borrow_mut() = ready;
        woke
    }

    fn perform(&self, fd: RawFd, readiness: Readiness) {
        let mut operations = self.operations.borrow_mut();
        let Some(entry) = operations.get_mut(&fd) else {
            return;
        };

        let mut finished = Vec::new();

        if readiness.readable || readiness.failed {
            if let Some(operation) = entry.inbound.take() {
                match attempt(fd, &operation.context) {
                    Some(result) => finished.push((operation, result)),
                    None => entry.inbound = Some(operation),
                }
            }
        }

        if readiness.writable || readiness.failed {
            if let Some(operation) = entry.outbound.take() {
                match attempt(fd, &operation.context) {
                    Some(result) => finished.push((operation, result)),
                    None => entry.outbound = Some(operation),
                }
            }
        }

        if let Err(err) = self.sync_interest(fd, entry) {
            log::error!("failed to update epoll interest for fd {fd}: {err}");
        }

        if entry.registered.is_none() && entry.wanted().is_none() {
            operations.remove(&fd);
        }

        let mut port = self.port.borrow_mut();
        for (operation, result) in finished {
            port.push_back(IoItem {
                handler: operation.handler,
                context: operation.context,
                result,
            });
        }
    }

    fn deliver(&self, item: IoItem) {
        item.context.pending.set(false);

        match item.handler.upgrade() {
            Some(handler) => handler.on_io_completed(&item.context, item.result),
            None => log::trace!(
                "dropping {:?} completion for a released handler",
                item.context.operation()
            ),
        }
    }

    pub(crate) fn schedule_delayed_work(&self, delayed_work_time: TimeTicks) {
        self.delayed_work_time.set(delayed_work_time);
    }

    pub(crate) fn run(&self, delegate: &dyn PumpDelegate) {
        loop {
            let mut more_work_is_plausible = delegate.do_work();
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= self.wait_for_io_completion(Some(Duration::ZERO), None);
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= delegate.do_delayed_work(&self.delayed_work_time);
            if delegate.should_quit_current_loop() {
                return;
            }

            if more_work_is_plausible {
                continue;
            }

            more_work_is_plausible |= delegate.do_idle_work();
            if delegate.should_quit_current_loop() {
                return;
            }

            more_work_is_plausible |= delegate.check_extension_signal();
            if delegate.should_quit_current_loop() {
                return;
            }

            if more_work_is_plausible {
                continue;
            }

            self.wait_for_work();
        }
    }

    fn wait_for_work(&self) {
        let timeout = delay_until(self.delayed_work_time.get());
        self.wait_for_io_completion(timeout, None);
    }
}

// Runs the syscall behind `context`. `None` means the descriptor was not
// actually ready and the operation stays pending.
fn attempt(fd: RawFd, context: &IoContext) -> Option<io::Result<usize>> {
    match context.operation() {
        IoOperation::Accept => {
            let conn = unsafe {
                accept4(
                    fd,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    SOCK_NONBLOCK | SOCK_CLOEXEC,
                )
            };

            if conn < 0 {
                return retry_or_fail(io::Error::last_os_error());
            }

            *context.accepted.borrow_mut() = Some(unsafe { OwnedFd::from_raw_fd(conn) });
            Some(Ok(0))
        }
        IoOperation::Read => {
            let mut buffer = context.buffer.borrow_mut();
            let n = unsafe { recv(fd, buffer.as_mut_ptr() as *mut _, buffer.len(), 0) };

            if n < 0 {
                return retry_or_fail(io::Error::last_os_error());
            }

            if n == 0 {
                return Some(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer closed the connection",
                )));
            }

            Some(Ok(n as usize))
        }
        IoOperation::Write => {
            let buffer = context.buffer.borrow();
            let len = context.len.get();

            while context.transferred.get() < len {
                let offset = context.transferred.get();
                let n = unsafe {
                    send(
                        fd,
                        buffer[offset..len].as_ptr() as *const _,
                        len - offset,
                        MSG_NOSIGNAL,
                    )
                };

                if n < 0 {
                    return retry_or_fail(io::Error::last_os_error());
                }

                context.transferred.set(offset + n as usize);
            }

            Some(Ok(len))
        }
    }
}

fn retry_or_fail(err: io::Error) -> Option<io::Result<usize>> {
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EWOULDBLOCK || code == EINTR => None,
        _ => Some(Err(err)),
    }
}
