// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Non-blocking socket façade with blocking-like call semantics.
//!
//! Every operation follows the same pattern: issue the non-blocking
//! syscall; on success return; on `EWOULDBLOCK`/`EAGAIN` suspend on an
//! [`IoEvent`] of the matching direction and retry; on `EINTR` retry
//! immediately; on anything else fail with the OS errno. Deadlines are
//! enforced by the reactor's timed wait and surface as [`Fail`] with
//! `errno == ETIMEDOUT`.
//!
//! All suspending operations must run in a coroutine. `socket`, `bind`,
//! `listen` and the address helpers are plain calls.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::linux,
    runtime::{
        self,
        fail::Fail,
        scheduler::{
            self,
            NOT_A_COROUTINE,
        },
        Direction,
        IoEvent,
    },
};
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use ::std::{
    cell::RefCell,
    collections::HashMap,
    ffi::CStr,
    mem,
    net::{
        Shutdown,
        SocketAddr,
    },
    os::{
        fd::BorrowedFd,
        unix::prelude::{
            IntoRawFd,
            RawFd,
        },
    },
};

//======================================================================================================================
// Thread Local Storage
//======================================================================================================================

thread_local! {
    /// Per-thread errno-string cache. Entries are leaked exactly once per
    /// (thread, errno), so the returned references are stable for the
    /// lifetime of the process and repeated lookups do not allocate.
    static ERRNO_STRINGS: RefCell<HashMap<i32, &'static str>> = RefCell::new(HashMap::new());
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates a socket with `SOCK_NONBLOCK` and `SOCK_CLOEXEC` set atomically.
/// The caller owns the returned fd and must hand it to [`close`].
pub fn socket(domain: Domain, typ: Type, protocol: Option<Protocol>) -> Result<RawFd, Fail> {
    match Socket::new(domain, typ.nonblocking().cloexec(), protocol) {
        Ok(socket) => Ok(socket.into_raw_fd()),
        Err(e) => {
            let errno: i32 = linux::get_libc_err(e);
            let cause: String = format!("failed to create socket (errno={:?})", errno);
            error!("socket(): {}", cause);
            Err(Fail::new(errno, &cause))
        },
    }
}

/// Binds a socket to a local address.
pub fn bind(fd: RawFd, local: SocketAddr) -> Result<(), Fail> {
    let addr: SockAddr = local.into();
    if unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) } != 0 {
        let errno: i32 = linux::last_errno();
        let cause: String = format!("failed to bind socket (errno={:?})", errno);
        error!("bind(): {}", cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(())
}

/// Puts a socket into listening mode.
pub fn listen(fd: RawFd, backlog: i32) -> Result<(), Fail> {
    if unsafe { libc::listen(fd, backlog) } != 0 {
        let errno: i32 = linux::last_errno();
        let cause: String = format!("failed to listen on socket (errno={:?})", errno);
        error!("listen(): {}", cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(())
}

/// Local address a socket is bound to.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr, Fail> {
    let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
    match ::socket2::SockRef::from(&borrowed).local_addr() {
        Ok(addr) => match addr.as_socket() {
            Some(socketaddr) => Ok(socketaddr),
            None => Err(Fail::new(libc::EAFNOSUPPORT, "unsupported address family")),
        },
        Err(e) => Err(Fail::new(linux::get_libc_err(e), "failed to read local address")),
    }
}

/// Closes a socket. I/O interest is deregistered first so the reactor
/// cannot fire on a reused descriptor; with `ms > 0` the coroutine sleeps
/// before closing, giving the peer time to observe the shutdown. The fd is
/// released on any non-`EINTR` outcome.
pub async fn close(fd: RawFd, ms: u64) -> Result<(), Fail> {
    {
        let scheduler = scheduler::current().expect(NOT_A_COROUTINE);
        scheduler.reactor().del_fd(fd);
    }
    if ms > 0 {
        runtime::sleep(ms).await;
    }
    loop {
        if unsafe { libc::close(fd) } == 0 {
            return Ok(());
        }
        let errno: i32 = linux::last_errno();
        if errno != libc::EINTR {
            let cause: String = format!("failed to close socket (errno={:?})", errno);
            error!("close(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
}

/// Shuts down one or both directions of a connection, deregistering the
/// matching I/O interest first.
pub fn shutdown(fd: RawFd, how: Shutdown) -> Result<(), Fail> {
    let scheduler = scheduler::current().expect(NOT_A_COROUTINE);
    let raw_how: i32 = match how {
        Shutdown::Read => {
            scheduler.reactor().del_interest(fd, Direction::Read);
            libc::SHUT_RD
        },
        Shutdown::Write => {
            scheduler.reactor().del_interest(fd, Direction::Write);
            libc::SHUT_WR
        },
        Shutdown::Both => {
            scheduler.reactor().del_fd(fd);
            libc::SHUT_RDWR
        },
    };
    if unsafe { libc::shutdown(fd, raw_how) } != 0 {
        let errno: i32 = linux::last_errno();
        let cause: String = format!("failed to shutdown socket (errno={:?})", errno);
        error!("shutdown(): {}", cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(())
}

/// Accepts a connection on a listening socket, suspending until one
/// arrives. The connected fd comes back with `SOCK_NONBLOCK` and
/// `SOCK_CLOEXEC` already set.
pub async fn accept(fd: RawFd) -> Result<(RawFd, SocketAddr), Fail> {
    let ev: IoEvent = IoEvent::new(fd, Direction::Read);
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen: libc::socklen_t = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let connfd: i32 = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addrlen,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if connfd >= 0 {
            trace!("accept(): connection accepted (fd={:?})", connfd);
            let addr: SocketAddr = linux::sockaddr_to_socketaddr(storage, addrlen)?;
            return Ok((connfd, addr));
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            ev.wait(-1).await;
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to accept on socket (errno={:?})", errno);
            error!("accept(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
}

/// Connects a socket, suspending while the connection is in progress.
/// After a writability report the outcome is read back via `SO_ERROR`.
pub async fn connect(fd: RawFd, remote: SocketAddr, ms: i64) -> Result<(), Fail> {
    let addr: SockAddr = remote.into();
    loop {
        if unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) } == 0 {
            return Ok(());
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EINPROGRESS {
            let ev: IoEvent = IoEvent::new(fd, Direction::Write);
            if !ev.wait(ms).await {
                return Err(Fail::timed_out("connect timed out"));
            }
            let so_error: i32 = linux::socket_error(fd)?;
            if so_error == 0 {
                trace!("connect(): connection established ({:?})", remote);
                return Ok(());
            }
            let cause: String = format!("failed to connect socket (errno={:?})", so_error);
            error!("connect(): {}", cause);
            return Err(Fail::new(so_error, &cause));
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to connect socket (errno={:?})", errno);
            error!("connect(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
}

/// Receives at most `buf.len()` bytes; a single successful read completes
/// the call. `Ok(0)` reports an orderly peer close.
pub async fn recv(fd: RawFd, buf: &mut [u8], ms: i64) -> Result<usize, Fail> {
    let ev: IoEvent = IoEvent::new(fd, Direction::Read);
    loop {
        let nbytes: isize =
            unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if nbytes >= 0 {
            return Ok(nbytes as usize);
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            if !ev.wait(ms).await {
                return Err(Fail::timed_out("recv timed out"));
            }
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to receive on socket (errno={:?})", errno);
            error!("recv(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
}

/// Receives exactly `buf.len()` bytes or fails. `Ok(0)` reports an orderly
/// close before the buffer was filled. The deadline applies to each
/// individual wait, not to the call as a whole: a peer that keeps trickling
/// bytes within `ms` of each other never times the call out.
pub async fn recvn(fd: RawFd, buf: &mut [u8], ms: i64) -> Result<usize, Fail> {
    let total: usize = buf.len();
    let mut received: usize = 0;
    let ev: IoEvent = IoEvent::new(fd, Direction::Read);
    loop {
        let nbytes: isize = unsafe {
            libc::recv(
                fd,
                buf[received..].as_mut_ptr() as *mut libc::c_void,
                total - received,
                0,
            )
        };
        if nbytes > 0 {
            received += nbytes as usize;
            if received == total {
                return Ok(total);
            }
            continue;
        }
        if nbytes == 0 {
            return Ok(0);
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            if !ev.wait(ms).await {
                return Err(Fail::timed_out("recvn timed out"));
            }
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to receive on socket (errno={:?})", errno);
            error!("recvn(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
}

/// Sends the whole buffer or fails; mirrors [`recvn`], including the
/// per-wait deadline.
pub async fn send(fd: RawFd, buf: &[u8], ms: i64) -> Result<usize, Fail> {
    let total: usize = buf.len();
    let mut sent: usize = 0;
    let ev: IoEvent = IoEvent::new(fd, Direction::Write);
    while sent < total {
        let nbytes: isize =
            unsafe { libc::send(fd, buf[sent..].as_ptr() as *const libc::c_void, total - sent, 0) };
        if nbytes >= 0 {
            sent += nbytes as usize;
            continue;
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            if !ev.wait(ms).await {
                return Err(Fail::timed_out("send timed out"));
            }
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to send on socket (errno={:?})", errno);
            error!("send(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
    Ok(total)
}

/// Receives a single datagram together with the peer address.
pub async fn recvfrom(fd: RawFd, buf: &mut [u8], ms: i64) -> Result<(usize, SocketAddr), Fail> {
    let ev: IoEvent = IoEvent::new(fd, Direction::Read);
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen: libc::socklen_t = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let nbytes: isize = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if nbytes >= 0 {
            let addr: SocketAddr = linux::sockaddr_to_socketaddr(storage, addrlen)?;
            return Ok((nbytes as usize, addr));
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            if !ev.wait(ms).await {
                return Err(Fail::timed_out("recvfrom timed out"));
            }
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to receive on socket (errno={:?})", errno);
            error!("recvfrom(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
}

/// Sends the whole buffer to `remote` or fails.
pub async fn sendto(fd: RawFd, buf: &[u8], remote: SocketAddr, ms: i64) -> Result<usize, Fail> {
    let addr: SockAddr = remote.into();
    let total: usize = buf.len();
    let mut sent: usize = 0;
    let ev: IoEvent = IoEvent::new(fd, Direction::Write);
    while sent < total {
        let nbytes: isize = unsafe {
            libc::sendto(
                fd,
                buf[sent..].as_ptr() as *const libc::c_void,
                total - sent,
                0,
                addr.as_ptr(),
                addr.len(),
            )
        };
        if nbytes >= 0 {
            sent += nbytes as usize;
            continue;
        }

        let errno: i32 = linux::last_errno();
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            if !ev.wait(ms).await {
                return Err(Fail::timed_out("sendto timed out"));
            }
        } else if errno != libc::EINTR {
            let cause: String = format!("failed to send on socket (errno={:?})", errno);
            error!("sendto(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
    }
    Ok(total)
}

/// Message for an error code, as a pointer that stays valid for the
/// lifetime of the process. The synthetic deadline errno maps to a fixed
/// message.
pub fn strerror(errno: i32) -> &'static str {
    if errno == libc::ETIMEDOUT {
        return "Timed out";
    }
    ERRNO_STRINGS.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(message) = cache.get(&errno) {
            return *message;
        }
        let message: &'static str = Box::leak(format_errno(errno).into_boxed_str());
        cache.insert(errno, message);
        message
    })
}

fn format_errno(errno: i32) -> String {
    let mut buf: [libc::c_char; 256] = [0; 256];
    let rc: i32 = unsafe { libc::strerror_r(errno, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return format!("Unknown error {}", errno);
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::strerror;
    use ::anyhow::Result;

    #[test]
    fn strerror_returns_stable_pointers() -> Result<()> {
        let first: &'static str = strerror(libc::ECONNREFUSED);
        let second: &'static str = strerror(libc::ECONNREFUSED);
        crate::ensure_eq!(first, second);
        crate::ensure_eq!(::std::ptr::eq(first.as_ptr(), second.as_ptr()), true);
        Ok(())
    }

    #[test]
    fn strerror_maps_timed_out() -> Result<()> {
        crate::ensure_eq!(strerror(libc::ETIMEDOUT), "Timed out");
        Ok(())
    }

    #[test]
    fn strerror_handles_unknown_errno() -> Result<()> {
        let message: &'static str = strerror(-9999);
        crate::ensure_eq!(message.is_empty(), false);
        Ok(())
    }
}
