use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Monotonic clock accessor used for every deadline in the runtime.
///
/// Wall-clock time is never consulted: deadlines must survive clock
/// adjustments.
pub fn now() -> Instant {
    Instant::now()
}

/// Per-operation timeout request, normalized at registration time.
///
/// The original convention of encoding "use the default" as zero and
/// "no timeout" as a negative duration is expressed as explicit variants
/// instead of magic numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutSpec {
    /// Fall back to the socket default, then the scheduler default.
    #[default]
    Default,
    /// Wait forever.
    Never,
    /// Deadline `now + duration`. A zero duration resolves like `Default`.
    After(Duration),
}

impl TimeoutSpec {
    /// Resolve against a fallback (socket or scheduler default).
    ///
    /// Returns the relative duration to arm the timer wheel with, or
    /// `None` for no deadline at all.
    pub fn resolve(self, fallback: Option<Duration>) -> Option<Duration> {
        match self {
            TimeoutSpec::Default => fallback,
            TimeoutSpec::Never => None,
            TimeoutSpec::After(d) if d.is_zero() => fallback,
            TimeoutSpec::After(d) => Some(d),
        }
    }

    /// Whether this spec defers to a default.
    pub fn is_default(self) -> bool {
        matches!(self, TimeoutSpec::Default) || matches!(self, TimeoutSpec::After(d) if d.is_zero())
    }
}
