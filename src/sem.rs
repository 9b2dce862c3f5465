//! The binary lock primitive backing one registry entry.
//!
//! A [`BinarySemaphore`] is a capacity-1 semaphore constructed already
//! consumed (0 of 1 available), so the party that creates it holds it
//! without ever waiting. Waiters queue FIFO; `release` returns the single
//! unit of capacity and wakes the front waiter.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
pub(crate) struct BinarySemaphore {
    state: Mutex<SemState>,
}

#[derive(Debug)]
struct SemState {
    /// Whether the single unit of capacity is available.
    available: bool,
    /// FIFO queue of waiters.
    waiters: VecDeque<Waiter>,
    /// Monotonic counter for waiter identity.
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    waker: Waker,
}

/// Per-acquisition wait registration. A node is bound to at most one queue
/// position; abandoning it removes the position and hands a lost release
/// signal on to the next waiter.
#[derive(Debug, Default)]
pub(crate) struct WaitNode {
    id: Option<u64>,
}

fn front_waiter_waker(state: &SemState) -> Option<Waker> {
    state.waiters.front().map(|waiter| waiter.waker.clone())
}

fn remove_waiter_and_take_next_waker(state: &mut SemState, waiter_id: u64) -> Option<Waker> {
    if state
        .waiters
        .front()
        .is_some_and(|waiter| waiter.id == waiter_id)
    {
        // O(1) removal: the waiter is at the front of the FIFO queue
        // (common case). The front waiter may have absorbed a release
        // signal, so the caller must pass it on if capacity is available.
        state.waiters.pop_front();
        front_waiter_waker(state)
    } else {
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
        }
        None
    }
}

impl BinarySemaphore {
    /// Creates the semaphore with its capacity already consumed, so the
    /// creator owns the lock by construction.
    pub(crate) fn new_held() -> Self {
        Self {
            state: Mutex::new(SemState {
                available: false,
                waiters: VecDeque::with_capacity(4),
                next_waiter_id: 0,
            }),
        }
    }

    /// Takes the capacity if it is free and no waiter is queued ahead.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.available && state.waiters.is_empty() {
            state.available = false;
            true
        } else {
            false
        }
    }

    /// Returns the unit of capacity, waking the front waiter if any.
    pub(crate) fn release(&self) {
        let waker_to_wake = {
            let mut state = self.state.lock();
            debug_assert!(!state.available, "binary semaphore released twice");
            state.available = true;
            front_waiter_waker(&state)
        };
        // Wake outside the lock.
        if let Some(waker) = waker_to_wake {
            waker.wake();
        }
    }

    /// Polls for the capacity. FIFO: a waiter only acquires when it is at
    /// the front of the queue (or the queue is empty).
    pub(crate) fn poll_wait(&self, node: &mut WaitNode, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();

        let waiter_id = if let Some(id) = node.id {
            id
        } else {
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            node.id = Some(id);
            id
        };

        let is_next_in_line = state.waiters.front().is_none_or(|w| w.id == waiter_id);

        if is_next_in_line && state.available {
            state.available = false;
            if !state.waiters.is_empty() {
                state.waiters.pop_front();
            }
            drop(state);
            node.id = None;
            return Poll::Ready(());
        }

        // Register, or refresh the waker in case the executor supplied a
        // different one on this poll.
        if let Some(existing) = state.waiters.iter_mut().find(|w| w.id == waiter_id) {
            if !existing.waker.will_wake(cx.waker()) {
                existing.waker.clone_from(cx.waker());
            }
        } else {
            state.waiters.push_back(Waiter {
                id: waiter_id,
                waker: cx.waker().clone(),
            });
        }
        Poll::Pending
    }

    /// Withdraws a pending wait. If the departing waiter was at the front
    /// while capacity is available, the release signal it absorbed is
    /// passed to the next waiter.
    pub(crate) fn abandon_wait(&self, node: &mut WaitNode) {
        let Some(waiter_id) = node.id.take() else {
            return;
        };
        let next_waker = {
            let mut state = self.state.lock();
            let waker = remove_waiter_and_take_next_waker(&mut state, waiter_id);
            if state.available { waker } else { None }
        };
        if let Some(next) = next_waker {
            next.wake();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_available(&self) -> bool {
        self.state.lock().available
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
