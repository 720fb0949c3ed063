use crate::op::{Op, OpKind};
use skein_types::TimeoutSpec;
use socket2::{Domain, Protocol, SockAddr, Type};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

/// Default `SendFile` chunk size.
pub(crate) const SENDFILE_BLOCKSIZE: usize = 4096;

/// A non-blocking socket handle.
///
/// Cloning is a refcount bump: the underlying fd, the per-socket default
/// timeout, the proactor registration, and the stream pushback buffer are
/// shared by every clone. The fd is put into non-blocking mode at
/// construction and there is no way to re-enable blocking mode.
///
/// Regular socket calls (`recv`, `send`, `accept`, ...) do not perform
/// I/O; they build operations for a task to yield.
#[derive(Clone)]
pub struct Socket {
    state: Rc<SocketState>,
}

struct SocketState {
    fd: RefCell<Option<socket2::Socket>>,
    timeout: Cell<TimeoutSpec>,
    /// Proactor registration slot, set while any operation is queued.
    token: Cell<Option<usize>>,
    closed: Cell<bool>,
    /// Bytes read past a delimiter by the buffered stream. A direct
    /// `Recv` drains this before touching the fd, so nothing is ever
    /// delivered twice.
    pushback: RefCell<Vec<u8>>,
}

impl Socket {
    /// Open a socket of the given family and type, non-blocking.
    pub fn new(domain: Domain, ty: Type, protocol: Option<Protocol>) -> io::Result<Socket> {
        Self::wrap(socket2::Socket::new(domain, ty, protocol)?)
    }

    /// An IPv4 TCP socket.
    pub fn stream_v4() -> io::Result<Socket> {
        Self::new(Domain::IPV4, Type::STREAM, None)
    }

    /// An IPv6 TCP socket.
    pub fn stream_v6() -> io::Result<Socket> {
        Self::new(Domain::IPV6, Type::STREAM, None)
    }

    pub(crate) fn wrap(fd: socket2::Socket) -> io::Result<Socket> {
        fd.set_nonblocking(true)?;
        Ok(Socket {
            state: Rc::new(SocketState {
                fd: RefCell::new(Some(fd)),
                timeout: Cell::new(TimeoutSpec::Default),
                token: Cell::new(None),
                closed: Cell::new(false),
                pushback: RefCell::new(Vec::new()),
            }),
        })
    }

    /// Bind to a local address.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.with_fd(|fd| fd.bind(&SockAddr::from(addr)))
    }

    /// Start listening with the given backlog.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.with_fd(|fd| fd.listen(backlog))
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.with_fd(|fd| fd.set_reuse_address(reuse))
    }

    pub fn set_send_buffer_size(&self, bytes: usize) -> io::Result<()> {
        self.with_fd(|fd| fd.set_send_buffer_size(bytes))
    }

    pub fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()> {
        self.with_fd(|fd| fd.set_recv_buffer_size(bytes))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.with_fd(|fd| {
            fd.local_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet local address"))
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.with_fd(|fd| {
            fd.peer_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet peer address"))
        })
    }

    /// Default deadline stamped onto operations built from this socket.
    /// `TimeoutSpec::Default` defers to the scheduler default.
    pub fn set_timeout(&self, spec: TimeoutSpec) {
        self.state.timeout.set(spec);
    }

    pub fn timeout(&self) -> TimeoutSpec {
        self.state.timeout.get()
    }

    /// Line/byte stream adapter over this socket.
    pub fn makefile(&self) -> crate::net::BufferedStream {
        crate::net::BufferedStream::new(self)
    }

    // ── operation constructors ──

    /// Receive the first available chunk, at most `len` bytes.
    pub fn recv(&self, len: usize) -> Op {
        self.stamp(Op::new(OpKind::Recv {
            sock: self.clone(),
            len,
            drain_buffered: true,
        }))
    }

    /// One best-effort write.
    pub fn send(&self, buf: impl Into<Vec<u8>>) -> Op {
        self.stamp(Op::new(OpKind::Send {
            sock: self.clone(),
            buf: buf.into(),
        }))
    }

    /// Write the whole buffer, looping across partial writes.
    pub fn send_all(&self, buf: impl Into<Vec<u8>>) -> Op {
        self.stamp(Op::new(OpKind::SendAll {
            sock: self.clone(),
            buf: buf.into(),
            sent: 0,
        }))
    }

    /// Accept one connection; the new socket inherits non-blocking mode.
    pub fn accept(&self) -> Op {
        self.stamp(Op::new(OpKind::Accept { sock: self.clone() }))
    }

    /// Connect to a remote address.
    pub fn connect(&self, addr: SocketAddr) -> Op {
        self.stamp(Op::new(OpKind::Connect {
            sock: self.clone(),
            addr,
            started: false,
        }))
    }

    /// Transfer file bytes to the socket, zero-copy where the OS allows.
    ///
    /// `offset: None` starts at the file's current position; `length:
    /// None` sends until the file is exhausted. The chunk size defaults
    /// to 4096 and can be overridden with [`Op::blocksize`].
    pub fn sendfile(
        &self,
        mut file: File,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> io::Result<Op> {
        let offset = match offset {
            Some(o) => o,
            None => file.seek(SeekFrom::Current(0))?,
        };
        Ok(self.stamp(Op::new(OpKind::SendFile {
            sock: self.clone(),
            file,
            offset,
            length,
            blocksize: SENDFILE_BLOCKSIZE,
            sent: 0,
        })))
    }

    /// Close the socket. Every operation still pending on it resumes its
    /// task with `ConnectionClosed`; the fd is destroyed.
    pub fn close(&self) -> Op {
        self.stamp(Op::new(OpKind::Close { sock: self.clone() }))
    }

    fn stamp(&self, mut op: Op) -> Op {
        op.timeout = self.timeout();
        op
    }

    // ── runtime internals ──

    /// Run a syscall against the fd; `NotConnected` when already closed.
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(&socket2::Socket) -> io::Result<R>) -> io::Result<R> {
        match &*self.state.fd.borrow() {
            Some(fd) => f(fd),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.state.fd.borrow().as_ref().map(|fd| fd.as_raw_fd())
    }

    pub(crate) fn token(&self) -> Option<usize> {
        self.state.token.get()
    }

    pub(crate) fn set_token(&self, token: Option<usize>) {
        self.state.token.set(token);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Destroy the fd. The proactor deregisters first; once this runs,
    /// every later operation on the socket fails with `ConnectionClosed`.
    pub(crate) fn mark_closed(&self) {
        self.state.closed.set(true);
        self.state.token.set(None);
        if let Some(fd) = self.state.fd.borrow_mut().take() {
            let _ = fd.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn with_pushback<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.state.pushback.borrow_mut())
    }

    /// Move up to `max` retained bytes out of the pushback buffer.
    pub(crate) fn take_pushback(&self, max: usize) -> Vec<u8> {
        let mut buf = self.state.pushback.borrow_mut();
        let n = max.min(buf.len());
        buf.drain(..n).collect()
    }

    pub(crate) fn pushback_is_empty(&self) -> bool {
        self.state.pushback.borrow().is_empty()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.raw_fd())
            .field("closed", &self.is_closed())
            .field("registered", &self.token().is_some())
            .finish()
    }
}
