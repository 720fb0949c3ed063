//! The scheduler: run-queue management, operation dispatch, wakeup
//! delivery, timeout firing, and the task lifecycle.

use crate::op::{Op, OpKind, Outcome};
use crate::proactor::{self, PollOutput, Proactor, ProactorKind};
use crate::signals::{Fanout, SignalBus};
use crate::task::{Coroutine, Resume, Step, TaskCx, TaskRecord, TaskState, WaitSite};
use crate::timers::{TimerKind, TimerWheel};
use serde::{Deserialize, Serialize};
use skein_types::{Error, Priority, TaskId, Value, now};
use slab::Slab;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Scheduler configuration. Scoped to one scheduler; there is no
/// process-global state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Which proactor backend to drive I/O through.
    pub proactor: ProactorKind,
    /// Run-queue tag for operations that do not specify one.
    pub default_prio: Priority,
    /// Deadline for operations that do not specify one; `None` means
    /// operations wait forever by default.
    pub default_timeout: Option<Duration>,
    /// Upper bound on one proactor poll slice.
    pub resolution: Duration,
    /// Poll the proactor before draining the run queue each iteration.
    pub multiplex_first: bool,
    /// Drain repeated zero-timeout polls until no completions remain.
    pub proactor_greedy: bool,
    /// Retry partially complete operations in place within a poll pass.
    pub ops_greedy: bool,
    /// How many waiters one signal post releases.
    pub signal_fanout: Fanout,
    /// Spawned tasks start with a copy of the parent's task-locals.
    pub inherit_locals: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            proactor: ProactorKind::Default,
            default_prio: Priority::Default,
            default_timeout: None,
            resolution: Duration::from_millis(500),
            multiplex_first: false,
            proactor_greedy: false,
            ops_greedy: true,
            signal_fanout: Fanout::All,
            inherit_locals: false,
        }
    }
}

/// What processing a yielded operation did with the task.
enum Processed {
    /// Parked on a wait site; control returns to the run queue.
    Suspended,
    /// Finished on the spot; the task continues stepping in place.
    Immediate(Resume),
}

/// Single-threaded cooperative scheduler.
///
/// Owns every task record exclusively. Exactly one task executes at any
/// instant; tasks relinquish control only by yielding an operation or by
/// completing.
pub struct Scheduler {
    cfg: SchedConfig,
    tasks: Slab<TaskRecord>,
    runq: [VecDeque<TaskId>; Priority::LEVELS],
    timers: TimerWheel,
    signals: SignalBus,
    proactor: Box<dyn Proactor>,
    out: PollOutput,
}

impl Scheduler {
    /// Build a scheduler with the given configuration. Proactor
    /// construction failure is fatal.
    pub fn new(cfg: SchedConfig) -> Result<Self, Error> {
        let proactor = proactor::build(cfg.proactor, cfg.ops_greedy).map_err(|e| Error::socket(&e))?;
        Ok(Scheduler {
            cfg,
            tasks: Slab::new(),
            runq: Default::default(),
            timers: TimerWheel::new(),
            signals: SignalBus::new(),
            proactor,
            out: PollOutput::default(),
        })
    }

    pub fn with_defaults() -> Result<Self, Error> {
        Self::new(SchedConfig::default())
    }

    pub fn config(&self) -> &SchedConfig {
        &self.cfg
    }

    /// Create a task and place it on the run queue at the default
    /// priority. Returns before the task first executes.
    pub fn spawn(&mut self, coro: impl Coroutine + 'static) -> TaskId {
        self.add_task(Box::new(coro), self.cfg.default_prio, false, None)
    }

    /// Spawn at an explicit priority.
    pub fn spawn_prio(&mut self, coro: impl Coroutine + 'static, prio: Priority) -> TaskId {
        self.add_task(Box::new(coro), prio, false, None)
    }

    /// Spawn a task whose record is reaped as soon as it finishes.
    /// Detached tasks cannot be joined.
    pub fn spawn_detached(&mut self, coro: impl Coroutine + 'static, prio: Priority) -> TaskId {
        self.add_task(Box::new(coro), prio, true, None)
    }

    fn add_task(
        &mut self,
        coro: Box<dyn Coroutine>,
        prio: Priority,
        detached: bool,
        locals: Option<std::collections::HashMap<String, Value>>,
    ) -> TaskId {
        let mut record = TaskRecord::new(coro, prio, detached);
        if let Some(locals) = locals {
            record.locals = locals;
        }
        let id = TaskId(self.tasks.insert(record));
        self.push_runnable(id, prio);
        debug!(task = %id, ?prio, detached, "spawned");
        id
    }

    /// Wake every current waiter on `name` with a shared payload.
    /// Respects the configured fanout; returns how many tasks woke.
    pub fn post_signal(&mut self, name: &str, value: Value) -> usize {
        let woken = self.signals.notify(name, self.cfg.signal_fanout);
        let n = woken.len();
        for task in woken {
            self.wake(task, Ok(Outcome::Signalled(value.clone())));
        }
        n
    }

    /// Cooperatively cancel a task: its outstanding operation is removed
    /// from its wait site, and the coroutine observes `Cancelled` at the
    /// suspension point on its next step.
    pub fn cancel(&mut self, task: TaskId) {
        let Some(state) = self.tasks.get(task.0).map(|r| r.state) else {
            return;
        };
        match state {
            TaskState::Runnable => {
                self.tasks[task.0].resume = Some(Err(Error::Cancelled));
            }
            TaskState::Waiting => {
                self.remove_from_site(task);
                self.wake(task, Err(Error::Cancelled));
            }
            TaskState::Done | TaskState::Failed => {}
        }
    }

    /// The terminal state of a task, while its record is still tracked.
    pub fn state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(task.0).map(|r| r.state)
    }

    /// Drive tasks to quiescence: returns once the run queue is empty,
    /// the timer wheel is empty, and no proactor-registered operations
    /// remain. Signal waiters without a deadline are abandoned at that
    /// point.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.runq_is_empty() && self.timers.is_empty() && self.proactor.pending() == 0 {
                if self.signals.waiting() > 0 {
                    debug!(
                        abandoned = self.signals.waiting(),
                        "quiescent with parked signal waiters"
                    );
                }
                break;
            }

            if self.cfg.multiplex_first && !self.runq_is_empty() {
                let mut out = std::mem::take(&mut self.out);
                self.proactor.run(Duration::ZERO, &mut out).map_err(|e| Error::socket(&e))?;
                self.absorb(&mut out);
                self.out = out;
            }

            if let Some(task) = self.pop_runnable() {
                self.step_task(task);
            }

            let slice = self.poll_slice();
            let mut out = std::mem::take(&mut self.out);
            self.proactor.run(slice, &mut out).map_err(|e| Error::socket(&e))?;
            self.absorb(&mut out);
            self.fire_timers();

            if self.cfg.proactor_greedy {
                loop {
                    self.proactor.run(Duration::ZERO, &mut out).map_err(|e| Error::socket(&e))?;
                    if out.completions.is_empty() && out.progressed.is_empty() {
                        break;
                    }
                    self.absorb(&mut out);
                }
            }
            self.out = out;
        }
        Ok(())
    }

    // ── run loop internals ──

    fn runq_is_empty(&self) -> bool {
        self.runq.iter().all(VecDeque::is_empty)
    }

    fn push_runnable(&mut self, task: TaskId, prio: Priority) {
        self.runq[prio.index()].push_back(task);
    }

    fn pop_runnable(&mut self) -> Option<TaskId> {
        self.runq.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Bound the proactor poll: zero while work is runnable, otherwise
    /// up to the nearest deadline, capped at the configured resolution.
    fn poll_slice(&self) -> Duration {
        if !self.runq_is_empty() {
            return Duration::ZERO;
        }
        match self.timers.next_deadline() {
            Some(at) => at.saturating_duration_since(now()).min(self.cfg.resolution),
            None => self.cfg.resolution,
        }
    }

    /// Advance one task until it suspends, completes, or fails.
    /// Immediately completed operations keep the task stepping in place.
    fn step_task(&mut self, task: TaskId) {
        loop {
            let Some(rec) = self.tasks.get_mut(task.0) else {
                return;
            };
            let Some(mut coro) = rec.coro.take() else {
                return;
            };
            let input = rec.resume.take().unwrap_or(Ok(Outcome::Started));
            let step = {
                let mut cx = TaskCx {
                    id: task,
                    locals: &mut rec.locals,
                    now: now(),
                };
                coro.resume(&mut cx, input)
            };
            match step {
                Ok(Step::Yield(op)) => {
                    trace!(task = %task, op = op.kind.name(), "yielded");
                    self.tasks[task.0].coro = Some(coro);
                    match self.process_op(task, op) {
                        Processed::Suspended => return,
                        Processed::Immediate(resume) => {
                            self.tasks[task.0].resume = Some(resume);
                        }
                    }
                }
                Ok(Step::Return(value)) => {
                    self.finish(task, Ok(value));
                    return;
                }
                Err(err) => {
                    self.finish(task, Err(err));
                    return;
                }
            }
        }
    }

    /// Route a yielded operation to the proactor, the signal bus, or the
    /// timer wheel.
    fn process_op(&mut self, task: TaskId, op: Op) -> Processed {
        let wake_prio = op.prio.unwrap_or(self.cfg.default_prio);
        let deadline = op.timeout.resolve(self.cfg.default_timeout);
        let weak = op.weak_timeout;
        {
            let rec = &mut self.tasks[task.0];
            rec.wake_prio = wake_prio;
        }

        match op.kind {
            OpKind::Sleep { duration } => {
                self.suspend(task, WaitSite::Timer);
                self.timers.insert(now() + duration, task, TimerKind::Sleep);
                Processed::Suspended
            }
            OpKind::WaitSignal { name } => {
                self.signals.register(&name, task, wake_prio);
                self.suspend(task, WaitSite::Signal(name));
                self.arm_deadline(task, deadline, false);
                Processed::Suspended
            }
            OpKind::Notify { name, value } => {
                let woken = self.signals.notify(&name, self.cfg.signal_fanout);
                let n = woken.len();
                for waiter in woken {
                    self.wake(waiter, Ok(Outcome::Signalled(value.clone())));
                }
                trace!(task = %task, name = %name, woken = n, "signal posted");
                Processed::Immediate(Ok(Outcome::Notified(n)))
            }
            OpKind::Spawn { coro, detached } => {
                let locals = self
                    .cfg
                    .inherit_locals
                    .then(|| self.tasks[task.0].locals.clone());
                let child = self.add_task(coro, wake_prio, detached, locals);
                Processed::Immediate(Ok(Outcome::Spawned(child)))
            }
            OpKind::Join { task: target } => {
                let (joinable, terminal) = match self.tasks.get(target.0) {
                    None => (false, false),
                    Some(t) if t.detached => (false, false),
                    Some(t) => (true, t.state.is_terminal()),
                };
                if !joinable {
                    return Processed::Immediate(Err(Error::UnknownTask(target)));
                }
                if terminal {
                    // The one join consumes the record.
                    match self.tasks.remove(target.0).result {
                        Some(Ok(v)) => Processed::Immediate(Ok(Outcome::Joined(v))),
                        Some(Err(e)) => Processed::Immediate(Err(e)),
                        None => Processed::Immediate(Err(Error::UnknownTask(target))),
                    }
                } else {
                    self.tasks[target.0].joiners.push(task);
                    self.suspend(task, WaitSite::Join(target));
                    self.arm_deadline(task, deadline, false);
                    Processed::Suspended
                }
            }
            OpKind::Close { sock } => {
                let mut out = std::mem::take(&mut self.out);
                self.proactor.close_socket(&sock, &mut out);
                self.absorb(&mut out);
                self.out = out;
                Processed::Immediate(Ok(Outcome::Closed))
            }
            kind => {
                // Socket transfer: hand it to the proactor, which may
                // finish it on the spot via the run-first attempt.
                self.suspend(task, WaitSite::Proactor);
                let mut out = std::mem::take(&mut self.out);
                self.proactor.submit(task, kind, op.run_first, &mut out);
                let immediate = out.take_for(task);
                self.absorb(&mut out);
                self.out = out;
                match immediate {
                    Some(c) => {
                        let rec = &mut self.tasks[task.0];
                        rec.state = TaskState::Runnable;
                        rec.site = None;
                        Processed::Immediate(c.result)
                    }
                    None => {
                        self.arm_deadline(task, deadline, weak);
                        Processed::Suspended
                    }
                }
            }
        }
    }

    fn suspend(&mut self, task: TaskId, site: WaitSite) {
        let rec = &mut self.tasks[task.0];
        rec.state = TaskState::Waiting;
        rec.site = Some(site);
    }

    fn arm_deadline(&mut self, task: TaskId, deadline: Option<Duration>, weak: bool) {
        if let Some(d) = deadline {
            self.timers.insert(now() + d, task, TimerKind::Deadline {
                weak: weak.then_some(d),
            });
        }
    }

    /// Resume a waiting task with a finalized result.
    fn wake(&mut self, task: TaskId, resume: Resume) {
        self.timers.remove(task);
        let Some(rec) = self.tasks.get_mut(task.0) else {
            warn!(task = %task, "wakeup for an untracked task dropped");
            return;
        };
        rec.site = None;
        rec.state = TaskState::Runnable;
        rec.resume = Some(resume);
        let prio = rec.wake_prio;
        self.push_runnable(task, prio);
    }

    /// Apply one proactor pass: re-date weak deadlines for progressed
    /// operations, then deliver completions.
    fn absorb(&mut self, out: &mut PollOutput) {
        let at = now();
        for task in out.progressed.drain(..) {
            self.timers.bump(task, at);
        }
        for c in out.completions.drain(..) {
            self.wake(c.task, c.result);
        }
    }

    /// Fire every timer entry whose deadline has passed: sleeps complete
    /// normally, deadlines cancel their operation (cleanup runs exactly
    /// once, on removal) and resume the task with a timeout error.
    fn fire_timers(&mut self) {
        let at = now();
        while let Some((task, kind)) = self.timers.pop_due(at) {
            match kind {
                TimerKind::Sleep => self.wake(task, Ok(Outcome::Slept)),
                TimerKind::Deadline { .. } => {
                    if self.remove_from_site(task) {
                        self.wake(task, Err(Error::Timeout));
                    } else {
                        warn!(task = %task, "deadline fired but no operation was parked");
                    }
                }
            }
        }
    }

    /// Remove a waiting task's operation from wherever it is parked.
    /// Returns false if nothing was registered (already completed).
    fn remove_from_site(&mut self, task: TaskId) -> bool {
        let Some(rec) = self.tasks.get_mut(task.0) else {
            return false;
        };
        match rec.site.take() {
            Some(WaitSite::Timer) => true,
            Some(WaitSite::Proactor) => self.proactor.cancel(task),
            Some(WaitSite::Signal(name)) => self.signals.remove(&name, task),
            Some(WaitSite::Join(target)) => {
                if let Some(t) = self.tasks.get_mut(target.0) {
                    t.joiners.retain(|j| *j != task);
                }
                true
            }
            None => false,
        }
    }

    /// Record a task's terminal result and release its joiners.
    fn finish(&mut self, task: TaskId, result: Result<Value, Error>) {
        let (joiners, detached) = {
            let rec = &mut self.tasks[task.0];
            rec.coro = None;
            rec.state = if result.is_ok() {
                TaskState::Done
            } else {
                TaskState::Failed
            };
            (std::mem::take(&mut rec.joiners), rec.detached)
        };
        debug!(task = %task, ok = result.is_ok(), joiners = joiners.len(), "finished");

        if joiners.is_empty() {
            if let Err(err) = &result {
                // The observability hook for uncaught task errors.
                warn!(task = %task, %err, "task failed with no joiner");
            }
            if detached {
                self.tasks.remove(task.0);
            } else {
                self.tasks[task.0].result = Some(result);
            }
            return;
        }

        for joiner in joiners {
            let resume = match &result {
                Ok(v) => Ok(Outcome::Joined(v.clone())),
                Err(e) => Err(e.clone()),
            };
            self.wake(joiner, resume);
        }
        // Consumed by the joiners; nothing left to retain.
        self.tasks.remove(task.0);
    }
}
