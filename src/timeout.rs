//! Wait budgets for lock acquisition.

use std::time::{Duration, Instant};

/// How long an acquisition is willing to wait.
///
/// A zero budget turns the acquisition into a non-blocking probe: the lock
/// is taken if it is free at the moment of the call, otherwise the call
/// fails with [`AcquireError::Timeout`](crate::AcquireError::Timeout)
/// without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait forever (until cancelled).
    #[default]
    Never,
    /// Wait at most this long.
    After(Duration),
}

impl Timeout {
    /// A zero wait budget (non-blocking probe).
    pub const ZERO: Self = Self::After(Duration::ZERO);

    /// A budget of `millis` milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self::After(Duration::from_millis(millis))
    }

    /// Returns true for the unbounded budget.
    #[must_use]
    pub const fn is_never(self) -> bool {
        matches!(self, Self::Never)
    }

    /// Resolves the budget to an absolute deadline, `None` meaning no
    /// deadline. A duration too large to represent as an `Instant` is
    /// treated as unbounded.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::After(duration) => Instant::now().checked_add(duration),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Never, Self::After)
    }
}
