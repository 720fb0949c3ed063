//! The timer wheel: an ordered index of pending deadlines.
//!
//! One entry per waiting task (a task has at most one outstanding
//! operation, so the task id is the natural key). Entries for weak
//! timeouts remember their original relative duration so progress events
//! can re-date the deadline.

use skein_types::TaskId;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Why the entry exists, and what firing it means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// A `Sleep` operation: firing is the normal completion.
    Sleep,
    /// An operation deadline: firing cancels the operation and resumes
    /// the task with a timeout error. `weak` carries the original
    /// duration when each progress event should push the deadline out.
    Deadline { weak: Option<Duration> },
}

/// `(deadline, seq)` keeps same-instant entries in insertion order.
type Key = (Instant, u64);

#[derive(Default)]
pub(crate) struct TimerWheel {
    entries: BTreeMap<Key, (TaskId, TimerKind)>,
    index: HashMap<TaskId, Key>,
    seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline for `task`. Any previous entry for the task is
    /// replaced; a waiting task has exactly one.
    pub fn insert(&mut self, at: Instant, task: TaskId, kind: TimerKind) {
        self.remove(task);
        let key = (at, self.seq);
        self.seq += 1;
        self.entries.insert(key, (task, kind));
        self.index.insert(task, key);
    }

    /// Disarm the task's deadline, if any.
    pub fn remove(&mut self, task: TaskId) -> Option<TimerKind> {
        let key = self.index.remove(&task)?;
        self.entries.remove(&key).map(|(_, kind)| kind)
    }

    /// Progress event for a weak-timeout operation: re-date the deadline
    /// to `now + original`. Entries without a weak duration are left
    /// untouched.
    pub fn bump(&mut self, task: TaskId, now: Instant) {
        let Some(key) = self.index.get(&task).copied() else {
            return;
        };
        if let Some(&(_, TimerKind::Deadline { weak: Some(original) })) = self.entries.get(&key) {
            self.insert(now + original, task, TimerKind::Deadline {
                weak: Some(original),
            });
        }
    }

    /// The nearest deadline, for sizing the proactor poll slice.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Pop one due entry, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TaskId, TimerKind)> {
        let (&key, &(task, kind)) = self.entries.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key);
        self.index.remove(&task);
        Some((task, kind))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEAK: TimerKind = TimerKind::Deadline {
        weak: Some(Duration::from_millis(100)),
    };
    const HARD: TimerKind = TimerKind::Deadline { weak: None };

    #[test]
    fn pops_in_deadline_order_then_insertion_order() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.insert(t0 + Duration::from_millis(20), TaskId(2), HARD);
        wheel.insert(t0 + Duration::from_millis(10), TaskId(1), TimerKind::Sleep);
        wheel.insert(t0 + Duration::from_millis(20), TaskId(3), HARD);

        let late = t0 + Duration::from_millis(50);
        assert_eq!(wheel.pop_due(late), Some((TaskId(1), TimerKind::Sleep)));
        assert_eq!(wheel.pop_due(late), Some((TaskId(2), HARD)));
        assert_eq!(wheel.pop_due(late), Some((TaskId(3), HARD)));
        assert_eq!(wheel.pop_due(late), None);
        assert!(wheel.is_empty());
    }

    #[test]
    fn entries_in_the_future_do_not_fire() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.insert(t0 + Duration::from_secs(60), TaskId(1), HARD);
        assert_eq!(wheel.pop_due(t0), None);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn bump_advances_a_weak_deadline_by_its_original_duration() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.insert(t0 + Duration::from_millis(100), TaskId(1), WEAK);

        let progress_at = t0 + Duration::from_millis(80);
        wheel.bump(TaskId(1), progress_at);
        assert_eq!(
            wheel.next_deadline(),
            Some(progress_at + Duration::from_millis(100))
        );
    }

    #[test]
    fn bump_ignores_hard_deadlines_and_sleeps() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        let at = t0 + Duration::from_millis(100);
        wheel.insert(at, TaskId(1), HARD);
        wheel.bump(TaskId(1), t0 + Duration::from_millis(90));
        assert_eq!(wheel.next_deadline(), Some(at));
    }

    #[test]
    fn insert_replaces_the_previous_entry_for_a_task() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.insert(t0 + Duration::from_millis(100), TaskId(1), HARD);
        wheel.insert(t0 + Duration::from_millis(10), TaskId(1), HARD);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_millis(10)));
    }

    #[test]
    fn remove_disarms() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.insert(t0, TaskId(1), TimerKind::Sleep);
        assert_eq!(wheel.remove(TaskId(1)), Some(TimerKind::Sleep));
        assert_eq!(wheel.remove(TaskId(1)), None);
        assert!(wheel.is_empty());
    }
}
