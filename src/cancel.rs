//! Cancellation tokens for lock acquisition.
//!
//! A [`CancelToken`] is a clonable, sticky flag. Acquisitions check it
//! eagerly before any wait begins — a token that is already cancelled fails
//! the call even when the lock is immediately available — and register a
//! waker so that a later `cancel()` interrupts an in-progress wait promptly.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

/// A clonable cancellation signal.
///
/// All clones share the same state; cancelling any clone cancels them all.
/// Cancellation is permanent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    /// Lock-free shadow of the cancelled flag for read-heavy checks.
    cancelled: AtomicBool,
    watchers: Mutex<WatcherState>,
}

#[derive(Debug, Default)]
struct WatcherState {
    entries: Vec<Watcher>,
    next_id: u64,
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    waker: Waker,
}

/// Per-acquisition registration slot, so repeated polls refresh a single
/// watcher instead of piling up duplicates.
#[derive(Debug, Default)]
pub(crate) struct WatchNode {
    id: Option<u64>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is already cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    /// Returns true once `cancel` has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Signals cancellation, waking every registered waiter.
    pub fn cancel(&self) {
        let taken = {
            let mut state = self.shared.watchers.lock();
            // Set under the lock so watch() cannot register after the drain.
            self.shared.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut state.entries)
        };
        for watcher in taken {
            watcher.waker.wake();
        }
    }

    /// Checks for cancellation and, if not cancelled, registers or
    /// refreshes `node`'s waker. Returns true when cancelled.
    pub(crate) fn watch(&self, node: &mut WatchNode, waker: &Waker) -> bool {
        if self.is_cancelled() {
            node.id = None;
            return true;
        }
        let mut state = self.shared.watchers.lock();
        if self.shared.cancelled.load(Ordering::Acquire) {
            node.id = None;
            return true;
        }
        match node.id {
            Some(id) => {
                if let Some(existing) = state.entries.iter_mut().find(|w| w.id == id) {
                    if !existing.waker.will_wake(waker) {
                        existing.waker.clone_from(waker);
                    }
                } else {
                    state.entries.push(Watcher {
                        id,
                        waker: waker.clone(),
                    });
                }
            }
            None => {
                let id = state.next_id;
                state.next_id = state.next_id.wrapping_add(1);
                state.entries.push(Watcher {
                    id,
                    waker: waker.clone(),
                });
                node.id = Some(id);
            }
        }
        false
    }

    /// Removes `node`'s watcher registration, if any.
    pub(crate) fn unwatch(&self, node: &mut WatchNode) {
        let Some(id) = node.id.take() else { return };
        let mut state = self.shared.watchers.lock();
        if let Some(pos) = state.entries.iter().position(|w| w.id == id) {
            state.entries.remove(pos);
        }
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.shared.watchers.lock().entries.len()
    }
}
