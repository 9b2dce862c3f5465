//! Process-wide deadline driver for timed async waits.
//!
//! Async acquisitions with a finite budget register their waker here; a
//! single lazily-spawned thread services a min-heap of deadlines and wakes
//! each waker when its instant passes. Registration is fire-and-forget: an
//! entry whose acquisition already completed fires as a spurious wake,
//! which a well-formed future tolerates.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::task::Waker;
use std::time::Instant;

#[derive(Debug)]
struct Deadline {
    at: Instant,
    /// Tiebreaker so equal deadlines pop in registration order.
    generation: u64,
    waker: Waker,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.generation == other.generation
    }
}

impl Eq for Deadline {}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for a min-heap (earliest deadline first).
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct DriverState {
    heap: BinaryHeap<Deadline>,
    next_generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TimerDriver {
    state: Mutex<DriverState>,
    tick: Condvar,
}

impl TimerDriver {
    /// The process-wide driver. The service thread starts on first use and
    /// runs for the remainder of the process.
    pub(crate) fn global() -> &'static Self {
        static DRIVER: OnceLock<&'static TimerDriver> = OnceLock::new();
        DRIVER.get_or_init(|| {
            let driver: &'static TimerDriver = Box::leak(Box::new(TimerDriver::default()));
            std::thread::Builder::new()
                .name("lockreg-timer".into())
                .spawn(move || driver.run())
                .expect("failed to spawn lockreg timer thread");
            driver
        })
    }

    /// Schedules `waker` to be woken once `at` has passed.
    pub(crate) fn register(&self, at: Instant, waker: Waker) {
        let goes_first = {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation = state.next_generation.wrapping_add(1);
            let goes_first = state.heap.peek().is_none_or(|front| at < front.at);
            state.heap.push(Deadline {
                at,
                generation,
                waker,
            });
            goes_first
        };
        // Only a new earliest deadline shortens the service thread's sleep.
        if goes_first {
            self.tick.notify_one();
        }
    }

    fn run(&self) -> ! {
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            let mut expired = Vec::new();
            while state.heap.peek().is_some_and(|front| front.at <= now) {
                if let Some(deadline) = state.heap.pop() {
                    expired.push(deadline.waker);
                }
            }
            if !expired.is_empty() {
                // Wake outside the lock.
                drop(state);
                for waker in expired {
                    waker.wake();
                }
                state = self.state.lock();
                continue;
            }
            match state.heap.peek().map(|front| front.at) {
                Some(at) => {
                    let _ = self.tick.wait_until(&mut state, at);
                }
                None => self.tick.wait(&mut state),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().heap.len()
    }
}
