//! Cooperative coroutine runtime with an asynchronous I/O proactor.
//!
//! Tasks are resumable computations that suspend by yielding an
//! [`Op`](op::Op) describing what they want (a socket transfer, a timed
//! wait, a signal, a join). The [`Scheduler`](sched::Scheduler) routes each
//! operation to the [proactor](proactor) (I/O), the
//! [signal bus](signals), or the [timer wheel](timers), and resumes the
//! task with the operation's finalized value or error once the OS, the
//! clock, or another task completes it.
//!
//! Everything runs on one thread: exactly one task executes at any
//! instant, and a task relinquishes control only by yielding or by
//! completing.

pub mod net;
pub mod op;
pub mod proactor;
pub mod sched;
pub mod signals;
pub mod task;
pub mod timers;

#[cfg(test)]
mod scenarios;

pub use net::{BufferedStream, LineStep, ReadStep, Socket};
pub use op::{Op, OpKind, Outcome};
pub use proactor::{Completion, Proactor, ProactorKind};
pub use sched::{SchedConfig, Scheduler};
pub use signals::Fanout;
pub use task::{Coroutine, FnCoroutine, Resume, Step, TaskCx, TaskState, from_fn};
