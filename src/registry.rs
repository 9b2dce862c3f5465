//! The named-mutex registry.
//!
//! A [`LockRegistry`] maps arbitrary string names to binary lock entries.
//! An entry is created the first time a name is acquired and destroyed when
//! the last interested party — holder or waiter — lets go. The map invariant:
//! a name is present if and only if its entry's reference count is at least
//! one.
//!
//! # Reference counting
//!
//! The per-entry `refcount` counts logical interest (pending acquisitions
//! plus outstanding handles), not `Arc` references. It is mutated only under
//! the map mutex, and its zero-crossing is the single removal trigger — the
//! same decrement-and-maybe-remove sequence runs whether a handle is
//! released or a wait is abandoned (timeout, cancellation, dropped future),
//! which is what makes the timeout/release race lose nothing and free
//! nothing twice.
//!
//! # Waiting
//!
//! Map mutations are brief and synchronous; waiting happens only after the
//! map mutex is dropped, on the entry's own semaphore. Acquisitions of
//! distinct names never contend beyond those short critical sections.

use crate::cancel::{CancelToken, WatchNode};
use crate::error::AcquireError;
use crate::park;
use crate::sem::{BinarySemaphore, WaitNode};
use crate::timeout::Timeout;
use crate::timer::TimerDriver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

/// How names are compared when looking up entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameComparison {
    /// Ordinal comparison; `"Foo"` and `"foo"` are distinct locks.
    #[default]
    CaseSensitive,
    /// Names are folded with Unicode lowercasing before lookup.
    CaseInsensitive,
}

/// A registry of named mutual-exclusion locks.
///
/// Cloning is cheap and yields another handle to the same registry; fully
/// independent registries come from [`LockRegistry::new`]. A process-wide
/// default instance is available via [`LockRegistry::global`].
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    shared: Arc<RegistryShared>,
}

#[derive(Debug, Default)]
struct RegistryShared {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    /// Monotonic count of entries ever created, for leak detection.
    created: AtomicU64,
    /// Monotonic count of entries destroyed. At quiescence
    /// `created == destroyed`.
    destroyed: AtomicU64,
    comparison: NameComparison,
}

#[derive(Debug)]
struct Entry {
    /// The (possibly case-folded) map key.
    key: String,
    sem: BinarySemaphore,
    /// Logical holders plus in-flight waiters. Mutated only under the
    /// registry's map mutex.
    refcount: AtomicU64,
}

enum Joined {
    /// Fresh entry; the caller owns the lock by construction and never
    /// waits.
    Created(Arc<Entry>),
    /// Pre-existing entry; the caller's interest is counted and it must
    /// wait on the semaphore.
    Existing(Arc<Entry>),
}

impl RegistryShared {
    fn key_for(&self, name: &str) -> String {
        match self.comparison {
            NameComparison::CaseSensitive => name.to_owned(),
            NameComparison::CaseInsensitive => name.to_lowercase(),
        }
    }

    fn join(&self, name: &str) -> Joined {
        let key = self.key_for(name);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            entry.refcount.fetch_add(1, Ordering::Relaxed);
            return Joined::Existing(Arc::clone(entry));
        }
        let entry = Arc::new(Entry {
            key,
            sem: BinarySemaphore::new_held(),
            refcount: AtomicU64::new(1),
        });
        entries.insert(entry.key.clone(), Arc::clone(&entry));
        self.created.fetch_add(1, Ordering::Relaxed);
        let live = entries.len();
        drop(entries);
        tracing::trace!(name = %entry.key, live, "lock entry created");
        Joined::Created(entry)
    }

    /// Drops one unit of interest in `entry`, removing it from the map on
    /// the zero-crossing. Runs for handle release and abandoned waits
    /// alike.
    fn unjoin(&self, entry: &Arc<Entry>) {
        let mut entries = self.entries.lock();
        if entry.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        entries.remove(&entry.key);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        let live = entries.len();
        drop(entries);
        tracing::trace!(name = %entry.key, live, "lock entry destroyed");
    }
}

impl LockRegistry {
    /// Creates an empty registry with case-sensitive name comparison.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry with the given name-comparison policy.
    #[must_use]
    pub fn with_name_comparison(comparison: NameComparison) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                comparison,
                ..RegistryShared::default()
            }),
        }
    }

    /// The process-wide default registry, lazily constructed on first
    /// access and never reset for the lifetime of the process.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<LockRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Acquires the lock for `name`, blocking the calling thread until the
    /// lock is granted, `timeout` elapses, or `cancel` fires.
    ///
    /// The first acquirer of a name never blocks. A pre-cancelled token
    /// fails immediately with [`AcquireError::Cancelled`] even when the
    /// lock is free.
    ///
    /// # Errors
    ///
    /// [`AcquireError::Timeout`] if the budget elapsed,
    /// [`AcquireError::Cancelled`] if cancellation was signalled before or
    /// during the wait.
    pub fn acquire(
        &self,
        name: &str,
        timeout: impl Into<Timeout>,
        cancel: &CancelToken,
    ) -> Result<LockHandle, AcquireError> {
        let deadline = timeout.into().deadline();
        let future = Acquire::new(&self.shared, name, deadline, cancel.clone(), false);
        park::block_on(future, deadline)
    }

    /// Acquires the lock for `name`, suspending the calling task instead of
    /// blocking a thread. Same contract as [`acquire`](Self::acquire).
    ///
    /// The returned future is `'static` and can be moved into spawned
    /// tasks. Dropping it mid-wait cleanly withdraws the pending
    /// acquisition.
    pub fn acquire_async(
        &self,
        name: &str,
        timeout: impl Into<Timeout>,
        cancel: &CancelToken,
    ) -> Acquire {
        Acquire::new(
            &self.shared,
            name,
            timeout.into().deadline(),
            cancel.clone(),
            true,
        )
    }

    /// Blocking acquisition with no timeout and no cancellation.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the `Result` is kept so call sites compose
    /// with the timed and cancellable variants.
    pub fn lock(&self, name: &str) -> Result<LockHandle, AcquireError> {
        self.acquire(name, Timeout::Never, &CancelToken::new())
    }

    /// Suspending acquisition with no timeout and no cancellation.
    pub fn lock_async(&self, name: &str) -> Acquire {
        self.acquire_async(name, Timeout::Never, &CancelToken::new())
    }

    /// Non-blocking probe: takes the lock if `name` is unheld, otherwise
    /// fails immediately.
    ///
    /// # Errors
    ///
    /// [`AcquireError::Timeout`] when the lock is already held.
    pub fn try_lock(&self, name: &str) -> Result<LockHandle, AcquireError> {
        self.acquire(name, Timeout::ZERO, &CancelToken::new())
    }

    /// Number of live entries (names with at least one holder or waiter).
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Total entries ever created.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }

    /// Total entries destroyed. Equals [`created_count`](Self::created_count)
    /// at quiescence.
    #[must_use]
    pub fn destroyed_count(&self) -> u64 {
        self.shared.destroyed.load(Ordering::Relaxed)
    }
}

/// A successfully acquired named lock.
///
/// The handle is the capability to release the lock: releasing happens at
/// most once, either explicitly via [`release`](Self::release) or when the
/// handle is dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the handle is dropped"]
pub struct LockHandle {
    shared: Arc<RegistryShared>,
    entry: Arc<Entry>,
    /// The name as the caller spelled it, regardless of comparison policy.
    name: String,
    released: AtomicBool,
}

impl LockHandle {
    /// The name this handle was acquired for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`release`](Self::release) has already run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the lock. Idempotent: only the first call has any effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // Signal the semaphore first so a waiter wakes promptly. The
        // refcount decrement afterwards cannot free the entry out from
        // under that waiter: it holds its own increment from join time.
        self.entry.sem.release();
        self.shared.unjoin(&self.entry);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

enum AcquireState {
    /// Argument checks and map join still pending.
    Start,
    /// Joined an existing entry; waiting on its semaphore.
    Waiting(Arc<Entry>),
    Done,
}

/// Future returned by [`LockRegistry::acquire_async`].
///
/// Dropping the future mid-wait withdraws the pending acquisition: the
/// entry's refcount is decremented and the entry removed if this waiter was
/// the last interested party.
#[must_use = "futures do nothing unless polled"]
pub struct Acquire {
    shared: Arc<RegistryShared>,
    name: String,
    deadline: Option<Instant>,
    cancel: CancelToken,
    /// Whether to arm the process-wide timer for the deadline. The blocking
    /// path bounds its parks instead and needs no timer thread.
    use_timer: bool,
    state: AcquireState,
    wait: WaitNode,
    watch: WatchNode,
    /// Last waker armed on the timer, to re-arm only when it changes.
    timer_waker: Option<Waker>,
}

impl Acquire {
    fn new(
        shared: &Arc<RegistryShared>,
        name: &str,
        deadline: Option<Instant>,
        cancel: CancelToken,
        use_timer: bool,
    ) -> Self {
        Self {
            shared: Arc::clone(shared),
            name: name.to_owned(),
            deadline,
            cancel,
            use_timer,
            state: AcquireState::Start,
            wait: WaitNode::default(),
            watch: WatchNode::default(),
            timer_waker: None,
        }
    }

    fn handle(&self, entry: Arc<Entry>) -> LockHandle {
        LockHandle {
            shared: Arc::clone(&self.shared),
            entry,
            name: self.name.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Withdraws a pending wait: leaves the semaphore queue (handing on a
    /// lost release signal if one was absorbed), then drops this waiter's
    /// unit of interest in the entry.
    fn abandon(&mut self, entry: &Arc<Entry>) {
        entry.sem.abandon_wait(&mut self.wait);
        self.cancel.unwatch(&mut self.watch);
        self.shared.unjoin(entry);
        self.state = AcquireState::Done;
    }

    fn arm_timer(&mut self, at: Instant, waker: &Waker) {
        if self
            .timer_waker
            .as_ref()
            .is_none_or(|armed| !armed.will_wake(waker))
        {
            TimerDriver::global().register(at, waker.clone());
            self.timer_waker = Some(waker.clone());
        }
    }
}

impl Future for Acquire {
    type Output = Result<LockHandle, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.state {
                AcquireState::Start => {
                    // Cancellation is checked before any wait begins, even
                    // when the lock would be immediately available.
                    if this.cancel.is_cancelled() {
                        this.state = AcquireState::Done;
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    match this.shared.join(&this.name) {
                        Joined::Created(entry) => {
                            this.state = AcquireState::Done;
                            return Poll::Ready(Ok(this.handle(entry)));
                        }
                        Joined::Existing(entry) => {
                            this.state = AcquireState::Waiting(entry);
                        }
                    }
                }
                AcquireState::Waiting(ref waiting) => {
                    let entry = Arc::clone(waiting);
                    if this.cancel.watch(&mut this.watch, cx.waker()) {
                        this.abandon(&entry);
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    if entry.sem.poll_wait(&mut this.wait, cx).is_ready() {
                        this.cancel.unwatch(&mut this.watch);
                        this.state = AcquireState::Done;
                        return Poll::Ready(Ok(this.handle(entry)));
                    }
                    if let Some(at) = this.deadline {
                        // The semaphore attempt above ran first, so a zero
                        // budget still test-and-acquires exactly once.
                        if Instant::now() >= at {
                            this.abandon(&entry);
                            return Poll::Ready(Err(AcquireError::Timeout));
                        }
                        if this.use_timer {
                            this.arm_timer(at, cx.waker());
                        }
                    }
                    return Poll::Pending;
                }
                AcquireState::Done => panic!("Acquire polled after completion"),
            }
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if let AcquireState::Waiting(ref waiting) = self.state {
            let entry = Arc::clone(waiting);
            self.abandon(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn poll_once<T, F>(future: &mut F) -> Option<T>
    where
        F: Future<Output = T> + Unpin,
    {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(future).poll(&mut cx) {
            Poll::Ready(value) => Some(value),
            Poll::Pending => None,
        }
    }

    #[test]
    fn first_acquirer_never_waits() {
        let registry = LockRegistry::new();
        let mut fut = registry.acquire_async("foo", Timeout::Never, &CancelToken::new());
        let handle = poll_once(&mut fut).expect("first poll").expect("acquired");
        assert_eq!(handle.name(), "foo");
        assert_eq!(registry.instance_count(), 1);
        assert_eq!(registry.created_count(), 1);
        assert_eq!(registry.destroyed_count(), 0);
    }

    #[test]
    fn release_removes_entry_and_balances_counters() {
        let registry = LockRegistry::new();
        let handle = registry.lock("foo").expect("lock");
        assert_eq!(registry.instance_count(), 1);
        drop(handle);
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.created_count(), 1);
        assert_eq!(registry.destroyed_count(), 1);
    }

    #[test]
    fn explicit_release_is_idempotent() {
        let registry = LockRegistry::new();
        let handle = registry.lock("foo").expect("lock");
        assert!(!handle.is_released());
        handle.release();
        assert!(handle.is_released());
        handle.release();
        drop(handle);
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.destroyed_count(), 1);
    }

    #[test]
    fn second_acquirer_waits_until_release() {
        let registry = LockRegistry::new();
        let first = registry.lock("foo").expect("lock");

        let mut second = registry.acquire_async("foo", Timeout::Never, &CancelToken::new());
        assert!(poll_once(&mut second).is_none());
        assert_eq!(registry.instance_count(), 1);
        assert_eq!(registry.created_count(), 1);

        first.release();
        let handle = poll_once(&mut second)
            .expect("ready after release")
            .expect("acquired");
        assert_eq!(registry.instance_count(), 1);
        drop(handle);
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.created_count(), registry.destroyed_count());
    }

    #[test]
    fn distinct_names_are_independent() {
        let registry = LockRegistry::new();
        let _foo = registry.lock("foo").expect("lock foo");
        let bar = registry.try_lock("bar").expect("bar is free");
        assert_eq!(registry.instance_count(), 2);
        drop(bar);
        assert_eq!(registry.instance_count(), 1);
    }

    #[test]
    fn try_lock_fails_fast_on_held_name() {
        let registry = LockRegistry::new();
        let held = registry.lock("foo").expect("lock");
        assert_eq!(registry.try_lock("foo").unwrap_err(), AcquireError::Timeout);
        // The failed probe withdrew its interest; the holder's entry stays.
        assert_eq!(registry.instance_count(), 1);
        assert_eq!(registry.created_count(), 1);
        assert_eq!(registry.destroyed_count(), 0);
        drop(held);
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn zero_timeout_succeeds_on_unheld_name() {
        let registry = LockRegistry::new();
        let handle = registry.try_lock("foo").expect("free name");
        assert_eq!(handle.name(), "foo");
    }

    #[test]
    fn pre_cancelled_token_beats_available_lock() {
        let registry = LockRegistry::new();
        let result = registry.acquire("foo", Timeout::Never, &CancelToken::cancelled());
        assert_eq!(result.unwrap_err(), AcquireError::Cancelled);
        // Cancellation fired before the map was touched.
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.created_count(), 0);
    }

    #[test]
    fn cancel_during_wait_cleans_up() {
        let registry = LockRegistry::new();
        let _held = registry.lock("foo").expect("lock");
        let token = CancelToken::new();

        let mut fut = registry.acquire_async("foo", Timeout::Never, &token);
        assert!(poll_once(&mut fut).is_none());

        token.cancel();
        let result = poll_once(&mut fut).expect("ready after cancel");
        assert_eq!(result.unwrap_err(), AcquireError::Cancelled);
        assert_eq!(registry.instance_count(), 1);
    }

    #[test]
    fn dropping_pending_future_withdraws_interest() {
        let registry = LockRegistry::new();
        let held = registry.lock("foo").expect("lock");

        let mut fut = registry.acquire_async("foo", Timeout::Never, &CancelToken::new());
        assert!(poll_once(&mut fut).is_none());
        drop(fut);

        drop(held);
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.created_count(), 1);
        assert_eq!(registry.destroyed_count(), 1);
    }

    #[test]
    fn blocking_acquire_times_out() {
        let registry = LockRegistry::new();
        let _held = registry.lock("foo").expect("lock");
        let started = Instant::now();
        let result = registry.acquire("foo", Timeout::from_millis(30), &CancelToken::new());
        assert_eq!(result.unwrap_err(), AcquireError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(registry.instance_count(), 1);
    }

    #[test]
    fn async_acquire_times_out_via_timer() {
        let registry = LockRegistry::new();
        let _held = registry.lock("foo").expect("lock");

        let fut = registry.acquire_async("foo", Timeout::from_millis(30), &CancelToken::new());
        // Drive it through the parker; the wake at the deadline comes from
        // the timer thread, exactly as under an external executor.
        let result = park::block_on(fut, None);
        assert_eq!(result.unwrap_err(), AcquireError::Timeout);
        assert_eq!(registry.instance_count(), 1);
    }

    #[test]
    fn released_waiter_handoff_keeps_entry_alive() {
        let registry = LockRegistry::new();
        let first = registry.lock("foo").expect("lock");

        let mut second = registry.acquire_async("foo", Timeout::Never, &CancelToken::new());
        assert!(poll_once(&mut second).is_none());

        // Holder releases; entry must survive for the woken waiter.
        first.release();
        assert_eq!(registry.instance_count(), 1);
        let handle = poll_once(&mut second).expect("ready").expect("acquired");
        drop(handle);
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn case_insensitive_names_share_one_entry() {
        let registry = LockRegistry::with_name_comparison(NameComparison::CaseInsensitive);
        let held = registry.lock("Foo").expect("lock");
        assert_eq!(held.name(), "Foo");
        assert_eq!(registry.try_lock("FOO").unwrap_err(), AcquireError::Timeout);
        assert_eq!(registry.instance_count(), 1);
        drop(held);
        let other = registry.try_lock("foo").expect("free after release");
        assert_eq!(other.name(), "foo");
    }

    #[test]
    fn case_sensitive_names_are_distinct() {
        let registry = LockRegistry::new();
        let _upper = registry.lock("Foo").expect("lock");
        let _lower = registry.try_lock("foo").expect("distinct name");
        assert_eq!(registry.instance_count(), 2);
    }

    #[test]
    fn clones_share_state_new_registries_do_not() {
        let registry = LockRegistry::new();
        let clone = registry.clone();
        let _held = registry.lock("foo").expect("lock");
        assert_eq!(clone.instance_count(), 1);

        let independent = LockRegistry::new();
        assert_eq!(independent.instance_count(), 0);
        let _also_foo = independent.lock("foo").expect("independent namespace");
    }

    #[test]
    fn global_registry_is_a_singleton() {
        let a = LockRegistry::global();
        let b = LockRegistry::global();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
    }

    #[test]
    fn refcount_balance_over_many_names() {
        let registry = LockRegistry::new();
        let handles: Vec<_> = (0..80)
            .map(|i| registry.lock(&format!("name-{i}")).expect("lock"))
            .collect();
        assert_eq!(registry.instance_count(), 80);
        assert_eq!(registry.created_count(), 80);
        drop(handles);
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.created_count(), 80);
        assert_eq!(registry.destroyed_count(), 80);
    }
}
