//! Non-blocking syscall attempts for each socket operation kind.
//!
//! Every function makes at most one transfer syscall (retrying only on
//! `EINTR`) and reports how far it got. The proactor decides whether to
//! retry in place, park the operation, or report it complete.

use crate::net::Socket;
use crate::op::{OpKind, Outcome};
use skein_types::Error;
use socket2::SockAddr;
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;

/// Where one attempt left the operation.
pub(crate) enum Attempt {
    /// Finished; the outcome is ready for the task.
    Complete(Outcome),
    /// Forward progress, but bytes remain (`SendAll`, `SendFile`).
    Progress,
    /// The socket is not ready; stay parked until the next event.
    WouldBlock,
    Fail(Error),
}

pub(crate) fn attempt(kind: &mut OpKind) -> Attempt {
    match kind {
        OpKind::Recv {
            sock,
            len,
            drain_buffered,
        } => attempt_recv(sock, *len, *drain_buffered),
        OpKind::Send { sock, buf } => attempt_send(sock, buf),
        OpKind::SendAll { sock, buf, sent } => attempt_send_all(sock, buf, sent),
        OpKind::Accept { sock } => attempt_accept(sock),
        OpKind::Connect {
            sock,
            addr,
            started,
        } => attempt_connect(sock, *addr, started),
        OpKind::SendFile {
            sock,
            file,
            offset,
            length,
            blocksize,
            sent,
        } => attempt_sendfile(sock, file, *offset, *length, *blocksize, sent),
        other => unreachable!("{} never reaches the proactor", other.name()),
    }
}

/// Map a syscall error to the operation's fate. `Interrupted` is handled
/// by the per-function retry loops before this runs.
fn classify(err: io::Error) -> Attempt {
    match err.kind() {
        io::ErrorKind::WouldBlock => Attempt::WouldBlock,
        // `with_fd` on a locally closed socket.
        io::ErrorKind::NotConnected => Attempt::Fail(Error::ConnectionClosed),
        _ => Attempt::Fail(Error::socket(&err)),
    }
}

fn attempt_recv(sock: &Socket, len: usize, drain_buffered: bool) -> Attempt {
    if len == 0 {
        return Attempt::Complete(Outcome::Bytes(Vec::new()));
    }
    // Bytes the buffered stream read past its delimiter are delivered
    // before anything new is pulled off the wire.
    if drain_buffered && !sock.pushback_is_empty() {
        return Attempt::Complete(Outcome::Bytes(sock.take_pushback(len)));
    }
    loop {
        let res = sock.with_fd(|fd| {
            let mut buf = vec![MaybeUninit::<u8>::uninit(); len];
            let n = fd.recv(&mut buf)?;
            // SAFETY: recv initialized the first `n` bytes.
            Ok(buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect::<Vec<u8>>())
        });
        return match res {
            Ok(bytes) if bytes.is_empty() => Attempt::Fail(Error::ConnectionClosed),
            Ok(bytes) => Attempt::Complete(Outcome::Bytes(bytes)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => classify(e),
        };
    }
}

fn attempt_send(sock: &Socket, buf: &[u8]) -> Attempt {
    if buf.is_empty() {
        return Attempt::Complete(Outcome::Sent(0));
    }
    loop {
        return match sock.with_fd(|fd| fd.send(buf)) {
            Ok(n) => Attempt::Complete(Outcome::Sent(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => classify(e),
        };
    }
}

fn attempt_send_all(sock: &Socket, buf: &[u8], sent: &mut usize) -> Attempt {
    if *sent >= buf.len() {
        return Attempt::Complete(Outcome::SentAll(buf.len()));
    }
    loop {
        return match sock.with_fd(|fd| fd.send(&buf[*sent..])) {
            Ok(n) => {
                *sent += n;
                if *sent >= buf.len() {
                    Attempt::Complete(Outcome::SentAll(buf.len()))
                } else {
                    Attempt::Progress
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => classify(e),
        };
    }
}

fn attempt_accept(sock: &Socket) -> Attempt {
    loop {
        return match sock.with_fd(|fd| fd.accept()) {
            Ok((conn, addr)) => match accepted(conn, &addr) {
                Ok((conn, addr)) => Attempt::Complete(Outcome::Accepted(conn, addr)),
                Err(e) => Attempt::Fail(e),
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => classify(e),
        };
    }
}

/// Wrap an accepted connection; the new socket inherits non-blocking
/// mode through `Socket::wrap`.
fn accepted(conn: socket2::Socket, addr: &SockAddr) -> Result<(Socket, SocketAddr), Error> {
    let peer = addr.as_socket().ok_or_else(|| Error::Socket {
        errno: None,
        message: "accepted a non-inet peer".to_owned(),
    })?;
    let conn = Socket::wrap(conn).map_err(|e| Error::socket(&e))?;
    Ok((conn, peer))
}

fn attempt_connect(sock: &Socket, addr: SocketAddr, started: &mut bool) -> Attempt {
    if !*started {
        return match sock.with_fd(|fd| fd.connect(&SockAddr::from(addr))) {
            Ok(()) => Attempt::Complete(Outcome::Connected),
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
            {
                // In flight; completion is signalled by writability.
                *started = true;
                Attempt::WouldBlock
            }
            Err(e) => classify(e),
        };
    }
    // Writable: the attempt finished one way or the other.
    match sock.with_fd(socket2::Socket::take_error) {
        Ok(None) => Attempt::Complete(Outcome::Connected),
        Ok(Some(e)) => Attempt::Fail(Error::socket(&e)),
        Err(e) => classify(e),
    }
}

fn attempt_sendfile(
    sock: &Socket,
    file: &mut File,
    offset: u64,
    length: Option<u64>,
    blocksize: usize,
    sent: &mut u64,
) -> Attempt {
    let remaining = match length {
        Some(l) => {
            if *sent >= l {
                return Attempt::Complete(Outcome::SentFile(*sent));
            }
            l - *sent
        }
        // Unknown length: chunk until the file runs dry.
        None => u64::MAX,
    };
    let count = if blocksize == 0 {
        match length {
            Some(_) => remaining,
            None => crate::net::SENDFILE_BLOCKSIZE as u64,
        }
    } else {
        (blocksize as u64).min(remaining)
    };
    let count = usize::try_from(count).unwrap_or(usize::MAX);

    loop {
        return match sendfile_once(sock, file, offset + *sent, count) {
            Ok(0) => Attempt::Complete(Outcome::SentFile(*sent)),
            Ok(n) => {
                *sent += n as u64;
                if length.is_some_and(|l| *sent >= l) {
                    Attempt::Complete(Outcome::SentFile(*sent))
                } else {
                    Attempt::Progress
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => classify(e),
        };
    }
}

/// One `sendfile(2)` call: zero-copy from the page cache.
#[cfg(target_os = "linux")]
fn sendfile_once(sock: &Socket, file: &File, pos: u64, count: usize) -> io::Result<usize> {
    use std::os::fd::AsRawFd;
    sock.with_fd(|fd| {
        let mut off = pos as libc::off_t;
        let n = unsafe { libc::sendfile(fd.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

/// Buffered fallback: seek, read a chunk, send what the OS will take.
/// A short send is fine; the next attempt re-reads from the new offset.
#[cfg(not(target_os = "linux"))]
fn sendfile_once(sock: &Socket, file: &mut File, pos: u64, count: usize) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = vec![0_u8; count.min(64 * 1024)];
    let n = file.read(&mut buf)?;
    if n == 0 {
        return Ok(0);
    }
    sock.with_fd(|fd| fd.send(&buf[..n]))
}
