use crate::task_id::TaskId;
use std::io;

/// Unified error taxonomy for the runtime.
///
/// Deliberately `Clone`: a failed task's error is re-raised into every
/// joiner, and an operation error is both recorded on the task and
/// surfaced at its suspension point. `io::Error` is flattened to
/// `{errno, message}` to keep the derive.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Deadline reached with insufficient progress.
    #[error("operation timed out")]
    Timeout,
    /// Peer closed the connection, or the socket was closed locally while
    /// the operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
    /// Non-recoverable OS-level socket error.
    ///
    /// `message` already carries the OS rendering (io::Error's Display
    /// includes the errno text); `errno` is kept for callers that match
    /// on specific conditions.
    #[error("socket error: {message}")]
    Socket {
        errno: Option<i32>,
        message: String,
    },
    /// Cooperative cancellation of a task or operation.
    #[error("cancelled")]
    Cancelled,
    /// Signal bus misuse.
    #[error("signal error: {0}")]
    Signal(String),
    /// Buffered-stream framing violation (line too long, bad framing).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// `Join` on a task id the scheduler no longer tracks: a detached
    /// task, or one whose result was already consumed.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
}

impl Error {
    /// Flatten an OS error, preserving the errno for callers that match
    /// on specific conditions.
    pub fn socket(err: &io::Error) -> Self {
        Error::Socket {
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    /// Whether the error is terminal for the socket it occurred on.
    pub fn closes_socket(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Socket { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::socket(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn socket_errors_keep_the_errno() {
        let os = io::Error::from_raw_os_error(104);
        let err = Error::socket(&os);
        match err {
            Error::Socket { errno, .. } => assert_eq!(errno, Some(104)),
            other => panic!("expected Socket, got {other:?}"),
        }
    }

    #[test]
    fn display_is_stable_for_the_simple_kinds() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(Error::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn only_io_kinds_close_the_socket() {
        assert!(Error::ConnectionClosed.closes_socket());
        assert!(Error::socket(&io::Error::other("boom")).closes_socket());
        assert!(!Error::Timeout.closes_socket());
        assert!(!Error::Cancelled.closes_socket());
    }
}
