//! The task runtime: resumable coroutines, task state, and task-local
//! storage.

use crate::op::{Op, Outcome};
use skein_types::{Error, Priority, TaskId, Value};
use std::collections::HashMap;
use std::time::Instant;

/// What a task is resumed with: the previous operation's finalized value,
/// or the error raised at its suspension point.
pub type Resume = Result<Outcome, Error>;

/// What one resumption step produces.
pub enum Step {
    /// Suspend on a new operation.
    Yield(Op),
    /// The task is done; the value reaches any joiners.
    Return(Value),
}

impl Step {
    /// Finish with a concrete value.
    pub fn done<T: 'static>(v: T) -> Self {
        Step::Return(skein_types::value(v))
    }

    /// Finish without a meaningful result.
    pub fn unit() -> Self {
        Step::Return(skein_types::unit())
    }
}

/// A resumable producer of operations.
///
/// Each call advances the computation by one step: the input is the
/// previous operation's result (or [`Outcome::Started`] on the first
/// call), and the output is the next suspension, the terminal value, or
/// the task's uncaught error.
///
/// Cancellation arrives as `Err(Error::Cancelled)` at the suspension
/// point; dropping the coroutine runs the `Drop` impls of captured state,
/// which is the guaranteed-release path for scoped acquisitions.
pub trait Coroutine {
    fn resume(&mut self, cx: &mut TaskCx<'_>, input: Resume) -> Result<Step, Error>;
}

/// Adapter driving a closure as a [`Coroutine`].
///
/// State that must survive across suspensions lives in the closure's
/// captures, typically a small state enum advanced on each call.
pub struct FnCoroutine<F>(F);

impl<F> Coroutine for FnCoroutine<F>
where
    F: FnMut(&mut TaskCx<'_>, Resume) -> Result<Step, Error>,
{
    fn resume(&mut self, cx: &mut TaskCx<'_>, input: Resume) -> Result<Step, Error> {
        (self.0)(cx, input)
    }
}

/// Wrap a step closure as a coroutine.
pub fn from_fn<F>(f: F) -> FnCoroutine<F>
where
    F: FnMut(&mut TaskCx<'_>, Resume) -> Result<Step, Error>,
{
    FnCoroutine(f)
}

/// Per-step view a coroutine gets of its own task.
pub struct TaskCx<'a> {
    pub(crate) id: TaskId,
    pub(crate) locals: &'a mut HashMap<String, Value>,
    pub(crate) now: Instant,
}

impl TaskCx<'_> {
    /// The id of the running task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Monotonic time captured at the start of this step.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Read a task-local value. The clone is a refcount bump.
    pub fn local(&self, key: &str) -> Option<Value> {
        self.locals.get(key).cloned()
    }

    /// Store a task-local value, replacing any previous one.
    pub fn set_local(&mut self, key: impl Into<String>, value: Value) {
        self.locals.insert(key.into(), value);
    }

    /// Remove and return a task-local value.
    pub fn take_local(&mut self, key: &str) -> Option<Value> {
        self.locals.remove(key)
    }
}

/// Lifecycle of a task, as tracked by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// In the run queue, or currently executing.
    Runnable,
    /// Suspended on exactly one outstanding operation.
    Waiting,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// Where a waiting task's operation is parked, so that timeouts and
/// cancellation can remove it from exactly one place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum WaitSite {
    Timer,
    Signal(String),
    Proactor,
    Join(TaskId),
}

/// Scheduler-side record of one task. The boxed coroutine is owned
/// exclusively here; it leaves the record only for the duration of a
/// resumption step.
pub(crate) struct TaskRecord {
    pub coro: Option<Box<dyn Coroutine>>,
    pub state: TaskState,
    pub site: Option<WaitSite>,
    pub locals: HashMap<String, Value>,
    /// Input for the next resumption step.
    pub resume: Option<Resume>,
    /// Run-queue tag to use for the next wakeup.
    pub wake_prio: Priority,
    /// Tasks joined on this one.
    pub joiners: Vec<TaskId>,
    /// Terminal value, retained until a join consumes it.
    pub result: Option<Result<Value, Error>>,
    /// Reap the record immediately on completion; joins are refused.
    pub detached: bool,
}

impl TaskRecord {
    pub fn new(coro: Box<dyn Coroutine>, prio: Priority, detached: bool) -> Self {
        TaskRecord {
            coro: Some(coro),
            state: TaskState::Runnable,
            site: None,
            locals: HashMap::new(),
            resume: Some(Ok(Outcome::Started)),
            wake_prio: prio,
            joiners: Vec::new(),
            result: None,
            detached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::{downcast, value};

    fn cx<'a>(locals: &'a mut HashMap<String, Value>) -> TaskCx<'a> {
        TaskCx {
            id: TaskId(0),
            locals,
            now: Instant::now(),
        }
    }

    #[test]
    fn fn_coroutine_threads_state_through_captures() {
        let mut steps = 0_u32;
        let mut coro = from_fn(move |_cx, input| {
            assert!(input.is_ok());
            steps += 1;
            if steps < 3 {
                Ok(Step::Yield(Op::sleep(std::time::Duration::ZERO)))
            } else {
                Ok(Step::done(steps))
            }
        });

        let mut locals = HashMap::new();
        let mut c = cx(&mut locals);
        assert!(matches!(
            coro.resume(&mut c, Ok(Outcome::Started)),
            Ok(Step::Yield(_))
        ));
        assert!(matches!(coro.resume(&mut c, Ok(Outcome::Slept)), Ok(Step::Yield(_))));
        match coro.resume(&mut c, Ok(Outcome::Slept)) {
            Ok(Step::Return(v)) => assert_eq!(downcast::<u32>(&v), Some(&3)),
            _ => panic!("expected terminal step"),
        }
    }

    #[test]
    fn locals_round_trip_through_the_context() {
        let mut locals = HashMap::new();
        let mut c = cx(&mut locals);
        assert!(c.local("peer").is_none());
        c.set_local("peer", value(String::from("127.0.0.1")));
        let got = c.local("peer").expect("stored");
        assert_eq!(downcast::<String>(&got).map(String::as_str), Some("127.0.0.1"));
        assert!(c.take_local("peer").is_some());
        assert!(c.local("peer").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Runnable.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
    }
}
