//! The signal bus: named wait/notify channels scoped to one scheduler.
//!
//! A signal posted with no registered waiters is lost, never buffered;
//! waiters registered first receive a subsequent post. Waiters are
//! released FIFO within priority.

use serde::{Deserialize, Serialize};
use skein_types::{Priority, TaskId};
use std::collections::HashMap;

/// How many waiters one post releases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fanout {
    /// Release every current waiter (unbounded multiplicity).
    #[default]
    All,
    /// Release only the frontmost waiter.
    One,
}

#[derive(Clone, Copy, Debug)]
struct Waiter {
    task: TaskId,
    prio: Priority,
    /// Registration order, the FIFO tiebreaker within a priority.
    seq: u64,
}

#[derive(Default)]
pub(crate) struct SignalBus {
    waiters: HashMap<String, Vec<Waiter>>,
    seq: u64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `task` on `name`.
    pub fn register(&mut self, name: &str, task: TaskId, prio: Priority) {
        let seq = self.seq;
        self.seq += 1;
        self.waiters
            .entry(name.to_owned())
            .or_default()
            .push(Waiter { task, prio, seq });
    }

    /// Remove a parked waiter without delivery (timeout or cancel path).
    /// Returns whether the waiter was still registered.
    pub fn remove(&mut self, name: &str, task: TaskId) -> bool {
        let Some(list) = self.waiters.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| w.task != task);
        let removed = list.len() != before;
        if list.is_empty() {
            self.waiters.remove(name);
        }
        removed
    }

    /// Release waiters on `name`, FIFO within priority. Returns the
    /// released tasks in delivery order; empty means the signal is lost.
    pub fn notify(&mut self, name: &str, fanout: Fanout) -> Vec<TaskId> {
        let Some(mut list) = self.waiters.remove(name) else {
            return Vec::new();
        };
        list.sort_by_key(|w| (w.prio, w.seq));
        match fanout {
            Fanout::All => list.into_iter().map(|w| w.task).collect(),
            Fanout::One => {
                let released = list.remove(0).task;
                if !list.is_empty() {
                    // Back in registration order; priority is re-applied
                    // on the next post.
                    list.sort_by_key(|w| w.seq);
                    self.waiters.insert(name.to_owned(), list);
                }
                vec![released]
            }
        }
    }

    /// Total parked waiters across all names.
    pub fn waiting(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}
