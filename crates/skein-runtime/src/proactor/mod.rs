//! The proactor: owns OS readiness primitives and converts OS events
//! into task wakeups.
//!
//! The scheduler depends only on the capability set below; backends are
//! interchangeable without changing observable semantics. The shipped
//! backend is readiness-based on top of mio, which already performs the
//! per-platform multiplexer choice (epoll, kqueue). A completion-based
//! backend would implement the same trait.

mod attempt;
mod poll;

pub use poll::PollProactor;

use crate::net::Socket;
use crate::op::{OpKind, Outcome};
use serde::{Deserialize, Serialize};
use skein_types::{Error, TaskId};
use std::io;
use std::time::Duration;

/// A finished (or failed) operation, ready to resume its task.
#[derive(Debug)]
pub struct Completion {
    pub task: TaskId,
    pub result: Result<Outcome, Error>,
}

/// Everything one proactor pass produced.
#[derive(Debug, Default)]
pub struct PollOutput {
    pub completions: Vec<Completion>,
    /// Tasks whose operation made partial progress; the scheduler
    /// re-dates their weak-timeout deadlines.
    pub progressed: Vec<TaskId>,
}

impl PollOutput {
    /// Remove and return the completion for `task`, if this pass
    /// produced one. Used for operations that finish at registration.
    pub fn take_for(&mut self, task: TaskId) -> Option<Completion> {
        let at = self.completions.iter().position(|c| c.task == task)?;
        Some(self.completions.remove(at))
    }
}

/// Capability set the scheduler drives I/O through.
pub trait Proactor {
    /// Register a socket operation for `task`. May complete it
    /// immediately (the `run_first` attempt, a buffered recv, an
    /// already-closed socket); immediate results land in `out`.
    fn submit(&mut self, task: TaskId, kind: OpKind, run_first: bool, out: &mut PollOutput);

    /// Remove the pending operation owned by `task` (timeout, task
    /// cancel). Dropping the operation is its cleanup; returns whether
    /// anything was still registered.
    fn cancel(&mut self, task: TaskId) -> bool;

    /// Fail every operation pending on `sock` with `ConnectionClosed`,
    /// deregister it, and destroy the fd.
    fn close_socket(&mut self, sock: &Socket, out: &mut PollOutput);

    /// Block up to `timeout` for OS events and emit all completions and
    /// progress notices that occurred.
    fn run(&mut self, timeout: Duration, out: &mut PollOutput) -> io::Result<()>;

    /// Operations currently registered and not yet complete.
    fn pending(&self) -> usize;
}

/// Proactor variant selection.
///
/// Selection never changes observable semantics, only latency and
/// timeout resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProactorKind {
    /// Platform best. Currently the readiness backend.
    #[default]
    Default,
    /// The readiness multiplexer backend, explicitly.
    Poll,
}

/// Construct the selected backend. `ops_greedy` controls in-place retry
/// of partially complete operations within one poll pass.
pub fn build(kind: ProactorKind, ops_greedy: bool) -> io::Result<Box<dyn Proactor>> {
    match kind {
        ProactorKind::Default | ProactorKind::Poll => {
            Ok(Box::new(PollProactor::new(ops_greedy)?))
        }
    }
}
