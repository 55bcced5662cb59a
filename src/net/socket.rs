//! Unix-domain stream sockets standing in for named pipe instances.
//!
//! The pipe name is a filesystem path. A server binds one listening socket;
//! every accept slot works on its own duplicate of it so that slots can be
//! registered, cancelled and closed independently.

use libc::{
    AF_UNIX, F_GETFL, F_SETFL, O_NONBLOCK, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM, bind,
    connect, fcntl, listen, sockaddr, sockaddr_un, socket, socklen_t,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const LISTEN_BACKLOG: i32 = 128;

/// Creates a non-blocking listening socket bound to `path`.
///
/// A stale socket file left at `path` is removed first.
pub(crate) fn bind_listener(path: &Path) -> io::Result<OwnedFd> {
    let (address, len) = socket_address(path)?;

    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let fd = new_socket(SOCK_NONBLOCK)?;

    let ret = unsafe {
        bind(
            fd.as_raw_fd(),
            &address as *const sockaddr_un as *const sockaddr,
            len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let ret = unsafe { listen(fd.as_raw_fd(), LISTEN_BACKLOG) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Connects to the server listening on `path`.
///
/// The connect itself blocks; the returned socket is non-blocking.
pub(crate) fn connect_to(path: &Path) -> io::Result<OwnedFd> {
    let (address, len) = socket_address(path)?;
    let fd = new_socket(0)?;

    loop {
        let ret = unsafe {
            connect(
                fd.as_raw_fd(),
                &address as *const sockaddr_un as *const sockaddr,
                len,
            )
        };

        if ret == 0 {
            break;
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    set_nonblocking(fd.as_raw_fd())?;
    Ok(fd)
}

fn new_socket(flags: i32) -> io::Result<OwnedFd> {
    let fd = unsafe { socket(AF_UNIX, SOCK_STREAM | SOCK_CLOEXEC | flags, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn socket_address(path: &Path) -> io::Result<(sockaddr_un, socklen_t)> {
    let mut address: sockaddr_un = unsafe { mem::zeroed() };
    address.sun_family = AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the terminating NUL.
    if bytes.is_empty() || bytes.len() >= address.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pipe name {}", path.display()),
        ));
    }

    for (dst, src) in address.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((address, len as socklen_t))
}
