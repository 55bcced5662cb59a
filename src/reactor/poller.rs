//! Thin `epoll(7)` wrapper used by the I/O pump.
//!
//! Descriptors are registered level-triggered with a caller-chosen token; the
//! pump keeps interest in sync with the operations it has outstanding, so a
//! descriptor with nothing pending is not registered at all.

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Which directions a descriptor is watched for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
    };

    pub(crate) fn is_none(&self) -> bool {
        !self.read && !self.write
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0;
        if self.read {
            events |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if self.write {
            events |= EPOLLOUT as u32;
        }
        events
    }
}

/// Readiness reported for one descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) failed: bool,
}

impl Readiness {
    fn from_epoll(events: u32) -> Self {
        let failed = events & (EPOLLERR | EPOLLHUP) as u32 != 0;
        Self {
            readable: events & (EPOLLIN | EPOLLRDHUP) as u32 != 0,
            writable: events & EPOLLOUT as u32 != 0,
            failed,
        }
    }
}

pub(crate) struct Poller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
}

const MAX_EVENTS: usize = 64;

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.control(EPOLL_CTL_DEL, fd, 0, Interest::NONE)
    }

    fn control(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest.to_epoll(),
            u64: token,
        };

        let ret = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits up to `timeout` (forever for `None`) and appends what became
    /// ready to `out`. An interrupted wait reports nothing.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<(u64, Readiness)>,
    ) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
        };

        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for event in self.events.iter().take(n as usize) {
            let token = event.u64;
            out.push((token, Readiness::from_epoll(event.events)));
        }

        Ok(n as usize)
    }
}
