//! The operation model: the suspension tokens tasks yield and the
//! finalized values they are resumed with.

use crate::net::Socket;
use crate::task::Coroutine;
use skein_types::{Priority, TaskId, TimeoutSpec, Value};
use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::time::Duration;

/// Queue a pending socket operation joins inside the proactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A suspendable operation, as yielded by a task.
///
/// The wrapper carries the scheduling fields every operation shares; the
/// payload lives in [`OpKind`]. Builder methods override the defaults
/// stamped at construction.
pub struct Op {
    pub kind: OpKind,
    /// Deadline request; resolves against the socket default, then the
    /// scheduler default.
    pub timeout: TimeoutSpec,
    /// When set, each successful partial transfer re-dates the deadline
    /// to `now + timeout` (idle-detection instead of total duration).
    pub weak_timeout: bool,
    /// Run-queue tag used when the task is woken; `None` means the
    /// scheduler default.
    pub prio: Option<Priority>,
    /// Attempt the operation once at registration, before parking it in
    /// the proactor.
    pub run_first: bool,
}

/// One case per operation kind. The set is closed: the scheduler
/// dispatches by variant, never through open-ended polymorphism.
pub enum OpKind {
    /// Timed wait; resumes with [`Outcome::Slept`] once `duration` has
    /// elapsed. A zero duration is a plain reschedule.
    Sleep { duration: Duration },
    /// Park until another task posts the named signal.
    WaitSignal { name: String },
    /// Wake the current waiters on `name` with a shared payload.
    /// Completes immediately; a notify with no waiters is lost, never
    /// buffered.
    Notify { name: String, value: Value },
    /// Operation form of spawn: enqueue a child task and return control
    /// to the caller before the child first runs. The child's priority
    /// is the operation's `prio`. Detached children are reaped on
    /// completion and cannot be joined.
    Spawn {
        coro: Box<dyn Coroutine>,
        detached: bool,
    },
    /// Park until `task` is done or failed; resumes with its terminal
    /// value or re-raises its error.
    Join { task: TaskId },
    /// First available chunk, at most `len` bytes. `drain_buffered` is
    /// cleared only by the buffered stream, whose reads bypass the
    /// pushback buffer they themselves fill.
    Recv {
        sock: Socket,
        len: usize,
        drain_buffered: bool,
    },
    /// One best-effort write of as much of `buf` as the OS accepts.
    Send { sock: Socket, buf: Vec<u8> },
    /// Write all of `buf`, looping across partial writes inside the
    /// proactor. `sent` is the running progress counter.
    SendAll {
        sock: Socket,
        buf: Vec<u8>,
        sent: usize,
    },
    /// Accept one connection on a listening socket.
    Accept { sock: Socket },
    /// Connect to `addr`; completes once the socket is writable with no
    /// pending `SO_ERROR`.
    Connect {
        sock: Socket,
        addr: SocketAddr,
        started: bool,
    },
    /// Transfer file bytes to the socket, zero-copy where the OS
    /// supports it. `length: None` sends until the file is exhausted; a
    /// `blocksize` of zero means a single attempt with the whole
    /// remaining length.
    SendFile {
        sock: Socket,
        file: File,
        offset: u64,
        length: Option<u64>,
        blocksize: usize,
        sent: u64,
    },
    /// Cancel every pending operation on the socket with
    /// `ConnectionClosed`, deregister it, and destroy the fd.
    Close { sock: Socket },
}

impl Op {
    pub fn new(kind: OpKind) -> Self {
        Op {
            kind,
            timeout: TimeoutSpec::Default,
            weak_timeout: false,
            prio: None,
            run_first: true,
        }
    }

    /// Timed wait for `duration`.
    pub fn sleep(duration: Duration) -> Self {
        Op::new(OpKind::Sleep { duration })
    }

    /// Park until the named signal is posted.
    pub fn wait_signal(name: impl Into<String>) -> Self {
        Op::new(OpKind::WaitSignal { name: name.into() })
    }

    /// Post the named signal to its current waiters.
    pub fn notify(name: impl Into<String>, value: Value) -> Self {
        Op::new(OpKind::Notify {
            name: name.into(),
            value,
        })
    }

    /// Spawn a joinable child task.
    pub fn spawn(coro: impl Coroutine + 'static) -> Self {
        Op::new(OpKind::Spawn {
            coro: Box::new(coro),
            detached: false,
        })
    }

    /// Spawn a child whose record is reaped as soon as it finishes.
    pub fn spawn_detached(coro: impl Coroutine + 'static) -> Self {
        Op::new(OpKind::Spawn {
            coro: Box::new(coro),
            detached: true,
        })
    }

    /// Wait for another task's terminal value.
    pub fn join(task: TaskId) -> Self {
        Op::new(OpKind::Join { task })
    }

    /// Override the deadline for this operation.
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = TimeoutSpec::After(d);
        self
    }

    /// Wait forever, whatever the socket or scheduler defaults say.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = TimeoutSpec::Never;
        self
    }

    /// Re-date the deadline on every partial transfer.
    pub fn weak(mut self) -> Self {
        self.weak_timeout = true;
        self
    }

    /// Wake the task at this priority when the operation completes.
    pub fn prio(mut self, p: Priority) -> Self {
        self.prio = Some(p);
        self
    }

    /// Park straight away instead of attempting once at registration.
    pub fn defer_first(mut self) -> Self {
        self.run_first = false;
        self
    }

    /// Chunk size for `SendFile`; zero means one attempt with the whole
    /// remaining length. No effect on other kinds.
    pub fn blocksize(mut self, n: usize) -> Self {
        if let OpKind::SendFile { blocksize, .. } = &mut self.kind {
            *blocksize = n;
        }
        self
    }
}

impl OpKind {
    /// The variant name, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Sleep { .. } => "Sleep",
            OpKind::WaitSignal { .. } => "WaitSignal",
            OpKind::Notify { .. } => "Notify",
            OpKind::Spawn { .. } => "Spawn",
            OpKind::Join { .. } => "Join",
            OpKind::Recv { .. } => "Recv",
            OpKind::Send { .. } => "Send",
            OpKind::SendAll { .. } => "SendAll",
            OpKind::Accept { .. } => "Accept",
            OpKind::Connect { .. } => "Connect",
            OpKind::SendFile { .. } => "SendFile",
            OpKind::Close { .. } => "Close",
        }
    }

    /// The socket the operation works on, if it is a socket operation.
    pub fn socket(&self) -> Option<&Socket> {
        match self {
            OpKind::Recv { sock, .. }
            | OpKind::Send { sock, .. }
            | OpKind::SendAll { sock, .. }
            | OpKind::Accept { sock }
            | OpKind::Connect { sock, .. }
            | OpKind::SendFile { sock, .. }
            | OpKind::Close { sock } => Some(sock),
            _ => None,
        }
    }

    /// Which proactor queue a pending socket operation belongs to.
    ///
    /// `Close` is handled synchronously by the scheduler and never
    /// queues, so it has no direction.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            OpKind::Recv { .. } | OpKind::Accept { .. } => Some(Direction::Read),
            OpKind::Send { .. }
            | OpKind::SendAll { .. }
            | OpKind::Connect { .. }
            | OpKind::SendFile { .. } => Some(Direction::Write),
            _ => None,
        }
    }
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Sleep { duration } => f.debug_struct("Sleep").field("duration", duration).finish(),
            OpKind::WaitSignal { name } => f.debug_struct("WaitSignal").field("name", name).finish(),
            OpKind::Notify { name, .. } => f.debug_struct("Notify").field("name", name).finish(),
            OpKind::Spawn { detached, .. } => {
                f.debug_struct("Spawn").field("detached", detached).finish()
            }
            OpKind::Join { task } => f.debug_struct("Join").field("task", task).finish(),
            OpKind::Recv { len, .. } => f.debug_struct("Recv").field("len", len).finish(),
            OpKind::Send { buf, .. } => f.debug_struct("Send").field("len", &buf.len()).finish(),
            OpKind::SendAll { buf, sent, .. } => f
                .debug_struct("SendAll")
                .field("len", &buf.len())
                .field("sent", sent)
                .finish(),
            OpKind::Accept { .. } => f.debug_struct("Accept").finish(),
            OpKind::Connect { addr, .. } => f.debug_struct("Connect").field("addr", addr).finish(),
            OpKind::SendFile {
                offset,
                length,
                blocksize,
                sent,
                ..
            } => f
                .debug_struct("SendFile")
                .field("offset", offset)
                .field("length", length)
                .field("blocksize", blocksize)
                .field("sent", sent)
                .finish(),
            OpKind::Close { .. } => f.debug_struct("Close").finish(),
        }
    }
}

/// The finalized value of a completed operation, handed back to the task
/// at its suspension point.
pub enum Outcome {
    /// Input to a task's very first resumption.
    Started,
    Slept,
    /// Payload delivered by a posted signal.
    Signalled(Value),
    /// How many waiters a notify released.
    Notified(usize),
    Spawned(TaskId),
    /// Terminal value of a joined task.
    Joined(Value),
    /// Chunk received; never empty (EOF surfaces as `ConnectionClosed`).
    Bytes(Vec<u8>),
    /// Bytes accepted by one best-effort write.
    Sent(usize),
    /// Total bytes written by a `SendAll`; always the full buffer.
    SentAll(usize),
    Accepted(Socket, SocketAddr),
    Connected,
    /// Total bytes transferred by a `SendFile`.
    SentFile(u64),
    Closed,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Started => "Started",
            Outcome::Slept => "Slept",
            Outcome::Signalled(_) => "Signalled",
            Outcome::Notified(_) => "Notified",
            Outcome::Spawned(_) => "Spawned",
            Outcome::Joined(_) => "Joined",
            Outcome::Bytes(_) => "Bytes",
            Outcome::Sent(_) => "Sent",
            Outcome::SentAll(_) => "SentAll",
            Outcome::Accepted(..) => "Accepted",
            Outcome::Connected => "Connected",
            Outcome::SentFile(_) => "SentFile",
            Outcome::Closed => "Closed",
        }
    }

    /// The received chunk, if this is a `Bytes` outcome.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Outcome::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The accepted connection, if this is an `Accepted` outcome.
    pub fn into_accepted(self) -> Option<(Socket, SocketAddr)> {
        match self {
            Outcome::Accepted(sock, addr) => Some((sock, addr)),
            _ => None,
        }
    }

    /// The signal or join payload, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Outcome::Signalled(v) | Outcome::Joined(v) => Some(v),
            _ => None,
        }
    }
}

// Value is not Debug, so the derive is off the table.
impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Notified(n) => write!(f, "Notified({n})"),
            Outcome::Spawned(id) => write!(f, "Spawned({id})"),
            Outcome::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Outcome::Sent(n) => write!(f, "Sent({n})"),
            Outcome::SentAll(n) => write!(f, "SentAll({n})"),
            Outcome::Accepted(_, addr) => write!(f, "Accepted({addr})"),
            Outcome::SentFile(n) => write!(f, "SentFile({n})"),
            other => f.write_str(other.name()),
        }
    }
}
