//! Error types for lock acquisition.

use core::fmt;

/// Error returned when a named-lock acquisition fails.
///
/// Timeout and cancellation are distinct outcomes: a caller that races a
/// deadline against a cancellation signal can tell which one fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquireError {
    /// The wait budget elapsed before the lock became available.
    Timeout,
    /// Cancellation was signalled before or during the wait.
    Cancelled,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for named lock"),
            Self::Cancelled => write!(f, "named lock acquisition cancelled"),
        }
    }
}

impl std::error::Error for AcquireError {}
