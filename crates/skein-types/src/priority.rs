use serde::{Deserialize, Serialize};

/// Run-queue tag for tasks and operation wakeups.
///
/// Tasks with the same tag run in FIFO order; a lower tag always runs
/// before a higher one. `First < Default < Last` by derived ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Jump the queue: runs before any `Default` or `Last` task.
    First,
    #[default]
    Default,
    /// Background work: runs only when nothing else is runnable.
    Last,
}

impl Priority {
    /// Index into the scheduler's per-priority FIFO rings.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Number of priority levels.
    pub const LEVELS: usize = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sorts_before_default_and_last() {
        assert!(Priority::First < Priority::Default);
        assert!(Priority::Default < Priority::Last);
    }

    #[test]
    fn indices_are_dense() {
        assert_eq!(Priority::First.index(), 0);
        assert_eq!(Priority::Default.index(), 1);
        assert_eq!(Priority::Last.index(), 2);
        assert_eq!(Priority::LEVELS, 3);
    }
}
