// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::socket2::SockAddr;
use ::std::{
    io,
    mem,
    net::SocketAddr,
    os::unix::prelude::RawFd,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Extracts the raw OS error code out of an [`io::Error`].
pub fn get_libc_err(e: io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Returns the calling thread's current `errno` value.
pub fn last_errno() -> i32 {
    get_libc_err(io::Error::last_os_error())
}

/// Creates an epoll instance with the close-on-exec flag set.
pub fn epoll_create() -> Result<RawFd, Fail> {
    let fd: RawFd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        let errno: i32 = last_errno();
        let cause: String = format!("failed to create epoll instance (errno={:?})", errno);
        error!("epoll_create(): {}", cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(fd)
}

/// Creates a non-blocking eventfd used to interrupt `epoll_wait`.
pub fn eventfd() -> Result<RawFd, Fail> {
    let fd: RawFd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let errno: i32 = last_errno();
        let cause: String = format!("failed to create eventfd (errno={:?})", errno);
        error!("eventfd(): {}", cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(fd)
}

/// Reads `SO_ERROR` from a socket. Used to harvest the outcome of a
/// non-blocking connect after the socket reports writability.
pub fn socket_error(fd: RawFd) -> Result<i32, Fail> {
    let mut err: libc::c_int = 0;
    let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc: i32 = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        let errno: i32 = last_errno();
        let cause: String = format!("failed to read SO_ERROR (errno={:?})", errno);
        error!("socket_error(): {}", cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(err)
}

/// Converts a raw socket address filled in by `accept4` or `recvfrom` into
/// a standard [`SocketAddr`].
pub fn sockaddr_to_socketaddr(storage: libc::sockaddr_storage, len: libc::socklen_t) -> Result<SocketAddr, Fail> {
    let addr: SockAddr = unsafe { SockAddr::new(storage, len) };
    match addr.as_socket() {
        Some(socketaddr) => Ok(socketaddr),
        None => {
            let cause: String = format!("unsupported address family (family={:?})", storage.ss_family);
            error!("sockaddr_to_socketaddr(): {}", cause);
            Err(Fail::new(libc::EAFNOSUPPORT, &cause))
        },
    }
}
