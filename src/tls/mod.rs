// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Blocking-style TLS over non-blocking sockets.
//!
//! A [`TlsStream`] binds an OpenSSL session to a non-blocking fd owned by
//! the socket façade and drives handshake, read, write and shutdown with
//! the same suspension protocol as plain sockets: `WANT_READ`/`WANT_WRITE`
//! suspend on an [`IoEvent`] of the matching direction, `EINTR` retries
//! immediately, and deadlines surface through [`timeout`]. Fatal protocol
//! errors poison the session; afterwards no further TLS operation
//! (including shutdown) is issued on it. The OpenSSL error queue of the
//! last failed call is kept in thread-local storage for [`strerror`].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    Direction,
    IoEvent,
};
use ::openssl::{
    error::ErrorStack,
    ssl::{
        ErrorCode,
        Ssl,
        SslContext,
        SslContextBuilder,
        SslFiletype,
        SslMethod,
        SslStream,
    },
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    io::{
        self,
        Read,
        Write,
    },
    os::unix::prelude::RawFd,
    path::Path,
    sync::Once,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian for process-wide OpenSSL initialization.
static INIT_SSL: Once = Once::new();

thread_local! {
    /// Snapshot of the error queue of the last failed TLS call on this thread.
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
    /// Whether the last TLS call on this thread ended due to a deadline.
    static TIMED_OUT: Cell<bool> = Cell::new(false);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Configuration for TLS sessions. Certificate and key must be installed
/// before the first session is created from the context.
pub struct TlsContext {
    builder: Option<SslContextBuilder>,
    built: Option<SslContext>,
}

/// One TLS session over a non-blocking socket.
pub struct TlsStream {
    stream: SslStream<NbSocket>,
    fd: RawFd,
    /// Set on `SSL_ERROR_SSL` / `SSL_ERROR_SYSCALL`; the session is dead.
    fatal: bool,
}

/// Raw-fd transport for the OpenSSL BIO. Would-block and interruption
/// surface as ordinary [`io::Error`]s, which OpenSSL folds back into
/// `WANT_READ`/`WANT_WRITE`/`SYSCALL` results for the driver loop.
struct NbSocket {
    fd: RawFd,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs OpenSSL library initialization once per process.
fn init_library() {
    INIT_SSL.call_once(|| {
        ::openssl::init();
    });
}

/// Message of the last failed TLS call on this thread. Reading it leaves
/// the stored message intact; the next failed call replaces it.
pub fn strerror() -> String {
    LAST_ERROR.with(|last| last.borrow().clone())
}

/// Whether the most recent TLS call on this thread ended due to a
/// deadline.
pub fn timeout() -> bool {
    TIMED_OUT.with(|flag| flag.get())
}

fn record_error(what: &str, detail: &str) {
    LAST_ERROR.with(|last| {
        let mut last = last.borrow_mut();
        last.clear();
        last.push_str(what);
        last.push_str(": ");
        last.push_str(detail);
    });
}

fn stack_to_fail(what: &str, stack: ErrorStack) -> Fail {
    let cause: String = format!("{}: {}", what, stack);
    error!("{}", cause);
    record_error(what, &stack.to_string());
    Fail::new(libc::EPROTO, &cause)
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TlsContext {
    /// Creates a context for the server side of the handshake.
    pub fn new_server() -> Result<Self, Fail> {
        Self::new(SslMethod::tls_server())
    }

    /// Creates a context for the client side of the handshake.
    pub fn new_client() -> Result<Self, Fail> {
        Self::new(SslMethod::tls_client())
    }

    fn new(method: SslMethod) -> Result<Self, Fail> {
        init_library();
        match SslContext::builder(method) {
            Ok(builder) => Ok(Self {
                builder: Some(builder),
                built: None,
            }),
            Err(stack) => Err(stack_to_fail("failed to create TLS context", stack)),
        }
    }

    /// Installs a PEM-encoded certificate.
    pub fn use_certificate_file(&mut self, path: &Path) -> Result<(), Fail> {
        let builder: &mut SslContextBuilder = self.builder_mut()?;
        builder
            .set_certificate_file(path, SslFiletype::PEM)
            .map_err(|stack| stack_to_fail("failed to load certificate file", stack))
    }

    /// Installs a PEM-encoded private key.
    pub fn use_private_key_file(&mut self, path: &Path) -> Result<(), Fail> {
        let builder: &mut SslContextBuilder = self.builder_mut()?;
        builder
            .set_private_key_file(path, SslFiletype::PEM)
            .map_err(|stack| stack_to_fail("failed to load private key file", stack))
    }

    /// Checks the consistency of the installed private key with the
    /// installed certificate. Must run before the first session is
    /// created, like the other configuration calls.
    pub fn check_private_key(&self) -> Result<(), Fail> {
        match &self.builder {
            Some(builder) => builder
                .check_private_key()
                .map_err(|stack| stack_to_fail("private key check failed", stack)),
            None => Err(Fail::new(
                libc::EINVAL,
                "TLS context cannot change after the first session",
            )),
        }
    }

    fn builder_mut(&mut self) -> Result<&mut SslContextBuilder, Fail> {
        match self.builder.as_mut() {
            Some(builder) => Ok(builder),
            None => Err(Fail::new(
                libc::EINVAL,
                "TLS context cannot change after the first session",
            )),
        }
    }

    /// The finished OpenSSL context, building it on first use.
    fn context(&mut self) -> &SslContext {
        if self.built.is_none() {
            let builder: SslContextBuilder = self
                .builder
                .take()
                .expect("context is either building or built");
            self.built = Some(builder.build());
        }
        self.built.as_ref().expect("just built")
    }
}

impl TlsStream {
    /// Binds a new session to a non-blocking socket. The fd stays owned by
    /// the caller, who closes it through the socket façade after the
    /// session is done.
    pub fn new(context: &mut TlsContext, fd: RawFd) -> Result<Self, Fail> {
        let ssl: Ssl = Ssl::new(context.context())
            .map_err(|stack| stack_to_fail("failed to create TLS session", stack))?;
        let stream: SslStream<NbSocket> = SslStream::new(ssl, NbSocket { fd })
            .map_err(|stack| stack_to_fail("failed to bind TLS session to socket", stack))?;
        Ok(Self {
            stream,
            fd,
            fatal: false,
        })
    }

    /// The socket this session is bound to.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Waits for a client to initiate the handshake and completes it.
    pub async fn accept(&mut self, ms: i64) -> Result<(), Fail> {
        self.drive(ms, "TLS accept", |stream| stream.accept()).await
    }

    /// Initiates the handshake with a server and completes it.
    pub async fn connect(&mut self, ms: i64) -> Result<(), Fail> {
        self.drive(ms, "TLS connect", |stream| stream.connect()).await
    }

    /// Receives at most `buf.len()` bytes of plaintext. `Ok(0)` reports an
    /// orderly TLS close from the peer.
    pub async fn recv(&mut self, buf: &mut [u8], ms: i64) -> Result<usize, Fail> {
        self.drive(ms, "TLS recv", |stream| match stream.ssl_read(buf) {
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(0),
            result => result,
        })
        .await
    }

    /// Receives exactly `buf.len()` bytes or fails; `Ok(0)` reports an
    /// orderly close mid-read. The deadline applies to each wait.
    pub async fn recvn(&mut self, buf: &mut [u8], ms: i64) -> Result<usize, Fail> {
        let total: usize = buf.len();
        let mut received: usize = 0;
        while received < total {
            match self.recv(&mut buf[received..], ms).await? {
                0 => return Ok(0),
                nbytes => received += nbytes,
            }
        }
        Ok(total)
    }

    /// Sends the whole buffer or fails; `Ok(0)` reports an orderly close
    /// from the peer before the buffer was out. The deadline applies to
    /// each wait.
    pub async fn send(&mut self, buf: &[u8], ms: i64) -> Result<usize, Fail> {
        let total: usize = buf.len();
        let mut sent: usize = 0;
        while sent < total {
            let nbytes: usize = self
                .drive(ms, "TLS send", |stream| match stream.ssl_write(&buf[sent..]) {
                    Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(0),
                    result => result,
                })
                .await?;
            if nbytes == 0 {
                return Ok(0);
            }
            sent += nbytes;
        }
        Ok(total)
    }

    /// Sends a close notification. A close notification already received
    /// from the peer counts as completion. Skipped entirely when the
    /// session already hit a fatal error: shutdown is meaningless after a
    /// protocol break.
    pub async fn shutdown(&mut self, ms: i64) -> Result<(), Fail> {
        if self.fatal {
            let cause: &str = "TLS shutdown skipped after fatal error";
            record_error("TLS shutdown", cause);
            return Err(Fail::new(libc::EPROTO, cause));
        }
        self.drive(ms, "TLS shutdown", |stream| match stream.shutdown() {
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(()),
            result => result.map(|_| ()),
        })
        .await
    }

    /// Runs one SSL operation to completion, suspending on `WANT_READ` /
    /// `WANT_WRITE` and retrying on interruption.
    async fn drive<T>(
        &mut self,
        ms: i64,
        what: &str,
        mut op: impl FnMut(&mut SslStream<NbSocket>) -> Result<T, ::openssl::ssl::Error>,
    ) -> Result<T, Fail> {
        TIMED_OUT.with(|flag| flag.set(false));
        if self.fatal {
            let cause: String = format!("{}: session has a fatal TLS error", what);
            return Err(Fail::new(libc::EPROTO, &cause));
        }

        loop {
            let e: ::openssl::ssl::Error = match op(&mut self.stream) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match e.code() {
                ErrorCode::WANT_READ => {
                    let ev: IoEvent = IoEvent::new(self.fd, Direction::Read);
                    if !ev.wait(ms).await {
                        TIMED_OUT.with(|flag| flag.set(true));
                        return Err(Fail::timed_out(what));
                    }
                },
                ErrorCode::WANT_WRITE => {
                    let ev: IoEvent = IoEvent::new(self.fd, Direction::Write);
                    if !ev.wait(ms).await {
                        TIMED_OUT.with(|flag| flag.set(true));
                        return Err(Fail::timed_out(what));
                    }
                },
                ErrorCode::ZERO_RETURN => {
                    // Orderly close from the peer, not a protocol break:
                    // the fatal latch stays clear and a later shutdown
                    // still runs. Callers that have a meaningful success
                    // value for this case intercept it in their own op.
                    let cause: String = format!("{}: peer closed the session", what);
                    record_error(what, "peer closed the session");
                    return Err(Fail::new(libc::ECONNRESET, &cause));
                },
                ErrorCode::SYSCALL => {
                    if let Some(io_error) = e.io_error() {
                        if io_error.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                    }
                    self.fatal = true;
                    let errno: i32 = e
                        .io_error()
                        .and_then(|io_error| io_error.raw_os_error())
                        .unwrap_or(libc::EPROTO);
                    let cause: String = format!("{}: syscall failed (errno={:?})", what, errno);
                    error!("drive(): {}", cause);
                    record_error(what, &e.to_string());
                    return Err(Fail::new(errno, &cause));
                },
                _ => {
                    self.fatal = true;
                    let cause: String = format!("{}: protocol failure", what);
                    error!("drive(): {}: {:?}", cause, e);
                    record_error(what, &e.to_string());
                    return Err(Fail::new(libc::EPROTO, &cause));
                },
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Read for NbSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let nbytes: isize =
            unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if nbytes < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(nbytes as usize)
    }
}

impl Write for NbSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let nbytes: isize =
            unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if nbytes < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(nbytes as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
