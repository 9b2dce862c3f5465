//! Thread-parking executor for the blocking acquisition path.
//!
//! The synchronous `acquire` drives the same future as the async path,
//! parking the calling thread between polls. `std::thread::park`'s token
//! semantics make the loop race-free: an unpark that lands between a poll
//! and the park makes the park return immediately.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::Instant;

#[derive(Debug)]
struct ThreadUnparker(Thread);

impl Wake for ThreadUnparker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Polls `future` to completion on the calling thread.
///
/// `deadline` bounds each park so the future is guaranteed a poll once its
/// own deadline passes; the future itself decides to fail with a timeout.
pub(crate) fn block_on<F: Future>(future: F, deadline: Option<Instant>) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadUnparker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        match deadline {
            Some(at) => {
                let now = Instant::now();
                if now < at {
                    thread::park_timeout(at - now);
                }
                // Past the deadline: re-poll immediately so the future can
                // report the timeout.
            }
            None => thread::park(),
        }
    }
}
