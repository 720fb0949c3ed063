use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a task within one scheduler.
///
/// Ids are slab keys: dense, reused after a task record is destroyed.
/// They are only meaningful to the scheduler that issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task({})", self.0)
    }
}
