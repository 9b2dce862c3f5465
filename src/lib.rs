//! In-process named mutex registry.
//!
//! `lockreg` maps arbitrary string names to mutual-exclusion locks shared
//! across threads and async tasks within one process. The set of names is
//! unbounded and dynamic: a lock entry is created the first time a name is
//! acquired and destroyed when the last holder or waiter lets go, so the
//! registry stays empty at quiescence no matter how many names pass through
//! it.
//!
//! # Acquisition
//!
//! Every acquisition can be blocking ([`LockRegistry::acquire`]) or
//! suspending ([`LockRegistry::acquire_async`]); both take a wait budget
//! ([`Timeout`]) and a [`CancelToken`], and both run the same bookkeeping —
//! the two paths differ only in whether the wait parks a thread or yields a
//! task. Timeout and cancellation are reported as distinct
//! [`AcquireError`] variants.
//!
//! The first acquirer of a name never waits: its entry is born already
//! owned. Later acquirers of the same name queue FIFO on the entry's
//! semaphore. Names never contend with each other.
//!
//! # Example
//!
//! ```
//! use lockreg::LockRegistry;
//!
//! let registry = LockRegistry::new();
//!
//! let guard = registry.lock("alpha")?;
//! assert_eq!(registry.instance_count(), 1);
//! assert!(registry.try_lock("alpha").is_err()); // held
//! let beta = registry.try_lock("beta")?;        // other names are free
//!
//! drop(guard);
//! assert_eq!(registry.instance_count(), 1); // "beta" still held
//! drop(beta);
//! assert_eq!(registry.instance_count(), 0);
//! assert_eq!(registry.created_count(), registry.destroyed_count());
//! # Ok::<(), lockreg::AcquireError>(())
//! ```
//!
//! # Re-entrancy
//!
//! Locks are not re-entrant: a holder that re-acquires the same name on the
//! same thread deadlocks (or times out, if it asked for a budget).

#![warn(missing_docs)]

mod cancel;
mod error;
mod park;
mod registry;
mod sem;
mod timeout;
mod timer;

pub use cancel::CancelToken;
pub use error::AcquireError;
pub use registry::{Acquire, LockHandle, LockRegistry, NameComparison};
pub use timeout::Timeout;
