// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Destroyed;
use crate::loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use crate::loom::sync::{Mutex, MutexGuard};
use crate::sync::agent::{SyncAgent, ThreadAgent, WakerAgent};
// See the note in `sync::agent`: record handles stay on `std`'s Arc so they
// coerce to `Arc<dyn SyncAgent>` under loom as well.
use std::sync::Arc;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::pin::Pin;
use core::task::{Context, Poll};

/// Sentinel for a record that is not currently enqueued.
const NO_INDEX: usize = usize::MAX;

/// Outcome slot of a wait on a [`SyncPoint`].
///
/// `None` and `Waiting` are transient; the other four states are terminal and
/// absorbing: once a record reaches one of them it never changes again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WaitState {
    /// Initial state before any interaction with a sync point.
    None = 0,
    /// The record is enqueued and its predicate has not been satisfied, nor
    /// has the wait been canceled or timed out, nor the sync point destroyed.
    Waiting = 1,
    /// The predicate was satisfied and the completion handler has run.
    PredicateSatisfied = 2,
    /// The wait's timeout elapsed before the predicate was satisfied.
    Timeout = 3,
    /// The sync point was destroyed before the predicate was satisfied.
    Destroyed = 4,
    /// The wait was canceled before the predicate was satisfied.
    Canceled = 5,
}

// === impl WaitState ===

impl WaitState {
    /// Returns `true` for the four absorbing outcomes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, WaitState::None | WaitState::Waiting)
    }

    fn from_u8(bits: u8) -> Self {
        match bits {
            0 => WaitState::None,
            1 => WaitState::Waiting,
            2 => WaitState::PredicateSatisfied,
            3 => WaitState::Timeout,
            4 => WaitState::Destroyed,
            5 => WaitState::Canceled,
            _ => unreachable!("invalid wait state {bits}"),
        }
    }
}

/// Per-wait bookkeeping shared between the waiter and the sync point's queue.
///
/// The queue entry owns the predicate and completion handler; this record
/// holds the pieces both sides need to see: the queue position, the outcome,
/// and the suspend/wake hooks.
pub(crate) struct WaitRecord {
    /// Position in the owning queue, or [`NO_INDEX`] when not enqueued.
    /// Only written under the sync point's lock.
    wait_index: AtomicUsize,
    /// A [`WaitState`] discriminant. Terminal values are only ever stored
    /// under the sync point's lock; reads may happen anywhere.
    wait_state: AtomicU8,
    agent: Arc<dyn SyncAgent>,
}

// === impl WaitRecord ===

impl WaitRecord {
    fn new(agent: Arc<dyn SyncAgent>) -> Arc<Self> {
        Arc::new(Self {
            wait_index: AtomicUsize::new(NO_INDEX),
            wait_state: AtomicU8::new(WaitState::None as u8),
            agent,
        })
    }

    pub(crate) fn state(&self) -> WaitState {
        WaitState::from_u8(self.wait_state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WaitState) {
        self.wait_state.store(state as u8, Ordering::Release);
    }

    fn index(&self) -> usize {
        self.wait_index.load(Ordering::Acquire)
    }

    fn set_index(&self, index: usize) {
        self.wait_index.store(index, Ordering::Release);
    }

    fn clear_index(&self) {
        self.wait_index.store(NO_INDEX, Ordering::Release);
    }
}

impl fmt::Debug for WaitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitRecord")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to an in-flight wait started with [`SyncPoint::wait_with`].
///
/// Lets the owner observe the outcome and other contexts request
/// [cancellation](SyncPoint::cancel).
#[derive(Debug)]
pub struct WaitHandle {
    record: Arc<WaitRecord>,
}

// === impl WaitHandle ===

impl WaitHandle {
    /// Current state of the wait.
    #[must_use]
    pub fn state(&self) -> WaitState {
        self.record.state()
    }

    /// Position in the sync point's queue, or `None` when the record is not
    /// enqueued (it either completed or never suspended).
    #[must_use]
    pub fn queue_index(&self) -> Option<usize> {
        match self.record.index() {
            NO_INDEX => None,
            index => Some(index),
        }
    }

    pub(crate) fn record(&self) -> &Arc<WaitRecord> {
        &self.record
    }
}

type Predicate<T> = Box<dyn FnMut(&mut T) -> bool + Send>;
type CompleteFn<T> = Box<dyn FnOnce(&mut T, WaitState) + Send>;

struct WaitEntry<T> {
    predicate: Predicate<T>,
    on_complete: Option<CompleteFn<T>>,
    record: Arc<WaitRecord>,
}

struct Inner<T> {
    state: T,
    queue: Vec<WaitEntry<T>>,
    destroyed: bool,
}

// === impl Inner ===

impl<T> Inner<T> {
    /// Walks the queue in FIFO order, completing up to `max_count` waiters
    /// whose predicates are satisfied. Runs under the sync point's lock.
    fn wake_ready(&mut self, max_count: usize) -> usize {
        let Inner { state, queue, .. } = self;
        let mut satisfied = 0;
        let mut idx = 0;

        while idx < queue.len() && satisfied < max_count {
            if (queue[idx].predicate)(state) {
                let mut entry = queue.remove(idx);
                for (pos, later) in queue.iter().enumerate().skip(idx) {
                    later.record.set_index(pos);
                }
                entry.record.clear_index();
                entry.record.set_state(WaitState::PredicateSatisfied);
                if let Some(on_complete) = entry.on_complete.take() {
                    on_complete(state, WaitState::PredicateSatisfied);
                }
                entry.record.agent.wake();
                satisfied += 1;
            } else {
                idx += 1;
            }
        }

        satisfied
    }

    /// Removes `record` from the queue and completes it with `terminal`.
    /// Returns `false` if the record is not (or no longer) queued here.
    fn splice(&mut self, record: &Arc<WaitRecord>, terminal: WaitState) -> bool {
        let Inner { state, queue, .. } = self;
        let idx = record.index();
        if idx == NO_INDEX {
            return false;
        }
        // A handle for a record of some other sync point could carry an index
        // that happens to be in range here; verify identity before splicing.
        if queue.get(idx).is_none_or(|entry| !Arc::ptr_eq(&entry.record, record)) {
            return false;
        }

        let mut entry = queue.remove(idx);
        for (pos, later) in queue.iter().enumerate().skip(idx) {
            later.record.set_index(pos);
        }
        entry.record.clear_index();
        entry.record.set_state(terminal);
        if let Some(on_complete) = entry.on_complete.take() {
            on_complete(state, terminal);
        }
        entry.record.agent.wake();
        true
    }

    /// Completes every queued record with [`WaitState::Destroyed`], in FIFO
    /// order, and empties the queue.
    fn complete_all_destroyed(&mut self) {
        let Inner { state, queue, .. } = self;
        for mut entry in queue.drain(..) {
            entry.record.clear_index();
            entry.record.set_state(WaitState::Destroyed);
            if let Some(on_complete) = entry.on_complete.take() {
                on_complete(state, WaitState::Destroyed);
            }
            entry.record.agent.wake();
        }
    }
}

/// Cheaply cloneable reference to a sync point's guts, used by the timeout
/// path (the timer callback must outlive the borrow of the `SyncPoint`) and
/// by the owned wait future.
pub(crate) struct SharedPoint<T> {
    inner: Arc<Mutex<Inner<T>>>,
    id: usize,
}

impl<T> Clone for SharedPoint<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            id: self.id,
        }
    }
}

/// RAII wrapper pairing the queue lock with the debug re-entrancy guard.
struct Locked<'a, T> {
    guard: MutexGuard<'a, Inner<T>>,
    #[cfg(debug_assertions)]
    _reentry: reentry::Guard,
}

impl<T> Deref for Locked<'_, T> {
    type Target = Inner<T>;

    fn deref(&self) -> &Inner<T> {
        &self.guard
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut Inner<T> {
        &mut self.guard
    }
}

// === impl SharedPoint ===

impl<T> SharedPoint<T> {
    fn lock(&self) -> Locked<'_, T> {
        #[cfg(debug_assertions)]
        let _reentry = reentry::enter(self.id);
        Locked {
            // A poisoned lock means a predicate or completion handler
            // panicked; the record involved was already terminal, so the
            // guarded data is still consistent and the point stays usable.
            guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
            #[cfg(debug_assertions)]
            _reentry,
        }
    }

    fn wait_boxed(
        &self,
        agent: Arc<dyn SyncAgent>,
        mut predicate: Predicate<T>,
        on_complete: CompleteFn<T>,
    ) -> WaitHandle {
        let record = WaitRecord::new(agent);
        let mut locked = self.lock();
        let inner = &mut *locked;

        if inner.destroyed {
            record.set_state(WaitState::Destroyed);
            on_complete(&mut inner.state, WaitState::Destroyed);
            return WaitHandle { record };
        }

        if predicate(&mut inner.state) {
            record.set_state(WaitState::PredicateSatisfied);
            on_complete(&mut inner.state, WaitState::PredicateSatisfied);
            return WaitHandle { record };
        }

        record.set_index(inner.queue.len());
        record.set_state(WaitState::Waiting);
        inner.queue.push(WaitEntry {
            predicate,
            on_complete: Some(on_complete),
            record: Arc::clone(&record),
        });
        tracing::trace!(point = self.id, queued = inner.queue.len(), "waiter enqueued");
        record.agent.mark_for_suspend();

        WaitHandle { record }
    }

    pub(crate) fn cancel_record(&self, record: &Arc<WaitRecord>) -> bool {
        let canceled = self.lock().splice(record, WaitState::Canceled);
        if canceled {
            tracing::trace!(point = self.id, "wait canceled");
        }
        canceled
    }

    /// Timeout half of the protocol: invoked by the timer callback. If
    /// satisfaction, cancellation, or destruction won the race the record is
    /// no longer queued and this does nothing.
    pub(crate) fn expire_record(&self, record: &Arc<WaitRecord>) -> bool {
        let expired = self.lock().splice(record, WaitState::Timeout);
        if expired {
            tracing::trace!(point = self.id, "wait timed out");
        }
        expired
    }

    fn try_trigger(&self, f: impl FnOnce(&mut T)) -> Result<(), Destroyed> {
        self.try_trigger_n(|state| {
            f(state);
            usize::MAX
        })
    }

    fn try_trigger_if(&self, f: impl FnOnce(&mut T) -> bool) -> Result<(), Destroyed> {
        self.try_trigger_n(|state| if f(state) { usize::MAX } else { 0 })
    }

    fn try_trigger_n(&self, f: impl FnOnce(&mut T) -> usize) -> Result<(), Destroyed> {
        let mut locked = self.lock();
        let inner = &mut *locked;
        if inner.destroyed {
            return Err(Destroyed(()));
        }

        let max_count = f(&mut inner.state);
        if max_count > 0 {
            let satisfied = inner.wake_ready(max_count);
            tracing::trace!(
                point = self.id,
                satisfied,
                still_waiting = inner.queue.len(),
                "trigger wake pass"
            );
        }
        Ok(())
    }

    fn destroy(&self) {
        let mut locked = self.lock();
        locked.destroyed = true;
        if !locked.queue.is_empty() {
            tracing::trace!(point = self.id, waiters = locked.queue.len(), "destroying sync point");
        }
        locked.complete_all_destroyed();
    }

    fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock().state)
    }
}

#[cfg(debug_assertions)]
mod reentry {
    use std::cell::RefCell;

    std::thread_local! {
        static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) struct Guard {
        key: usize,
    }

    /// Records that the current thread is entering the critical section of
    /// the sync point identified by `key`. Re-entering the same sync point
    /// from a predicate, completion handler, or wake hook would deadlock on
    /// the mutex, so it is turned into a panic here instead.
    pub(super) fn enter(key: usize) -> Guard {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            assert!(
                !held.contains(&key),
                "deadlock: a predicate, completion handler, or wake hook re-entered \
                 the SyncPoint that invoked it"
            );
            held.push(key);
        });
        Guard { key }
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|k| *k == self.key) {
                    held.remove(pos);
                }
            });
        }
    }
}

/// A serialization point for predicate-gated waiting.
///
/// A `SyncPoint<T>` owns a piece of shared state `T` and a FIFO queue of
/// waiters, both guarded by a single mutex. Waiters describe the condition
/// they are waiting for as a predicate over `&mut T`; [triggers] mutate the
/// state under the same lock and then complete, in enqueue order, the waiters
/// whose predicates the mutation satisfied. Cancellation, timeouts (via
/// [`PredicatedCondition`]), and [destruction] produce the alternative
/// terminal outcomes of [`WaitState`].
///
/// Dropping a `SyncPoint` destroys it: every waiter still queued is woken
/// with [`WaitState::Destroyed`] before the drop returns.
///
/// # Callbacks run under the lock
///
/// Predicates, completion handlers, and the agent wake hook are all invoked
/// while the sync point's lock is held. They must be short, must not block,
/// and **must not call back into the same sync point**; doing so deadlocks
/// by construction (debug builds catch it with a panic). Calling into a
/// *different* sync point from a wake hook is fine and is exactly how the
/// executor integration works.
///
/// [triggers]: SyncPoint::trigger
/// [destruction]: SyncPoint::destroy
/// [`PredicatedCondition`]: crate::sync::PredicatedCondition
pub struct SyncPoint<T> {
    shared: SharedPoint<T>,
}

// === impl SyncPoint ===

impl<T> SyncPoint<T> {
    /// Creates a sync point guarding `state`.
    pub fn new(state: T) -> Self {
        static NEXT_ID: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

        Self {
            shared: SharedPoint {
                inner: Arc::new(Mutex::new(Inner {
                    state,
                    queue: Vec::new(),
                    destroyed: false,
                })),
                id: NEXT_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed),
            },
        }
    }

    pub(crate) fn shared(&self) -> &SharedPoint<T> {
        &self.shared
    }

    /// Blocks the calling thread until `predicate` is satisfied by some
    /// trigger, or the sync point is destroyed, and returns the terminal
    /// state. `on_complete` runs atomically with the state transition, under
    /// the lock, in whichever thread caused it.
    pub fn wait(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        on_complete: impl FnOnce(&mut T, WaitState) + Send + 'static,
    ) -> WaitState {
        let agent = ThreadAgent::for_current();
        let handle = self.wait_with(agent.clone(), predicate, on_complete);
        agent.wait();
        handle.state()
    }

    /// Starts a wait using a caller-supplied [`SyncAgent`] and returns
    /// without blocking.
    ///
    /// Exactly one of three things happens under the lock before this
    /// returns: the wait completes `Destroyed` (the point was already
    /// destroyed), it completes `PredicateSatisfied` (the predicate already
    /// held), or the record is enqueued, the agent's
    /// [`mark_for_suspend`](SyncAgent::mark_for_suspend) hook runs, and the
    /// handle reports [`WaitState::Waiting`]. In the last case the caller is
    /// responsible for blocking on the agent's client-side primitive (for
    /// [`ThreadAgent`], [`ThreadAgent::wait`]).
    pub fn wait_with(
        &self,
        agent: Arc<impl SyncAgent + 'static>,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        on_complete: impl FnOnce(&mut T, WaitState) + Send + 'static,
    ) -> WaitHandle {
        self.shared
            .wait_boxed(agent, Box::new(predicate), Box::new(on_complete))
    }

    /// Waits for `predicate` without blocking the executor thread; resolves
    /// to the terminal [`WaitState`].
    ///
    /// Dropping the returned future before completion cancels the wait (the
    /// completion handler, if any, observes [`WaitState::Canceled`]).
    pub fn wait_async(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
    ) -> Wait<'_, T> {
        self.wait_async_with(predicate, |_, _| {})
    }

    /// Like [`wait_async`](SyncPoint::wait_async) with a completion handler
    /// that runs under the lock, atomically with the state transition.
    pub fn wait_async_with(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        on_complete: impl FnOnce(&mut T, WaitState) + Send + 'static,
    ) -> Wait<'_, T> {
        Wait {
            point: &self.shared,
            raw: RawWait::new(Box::new(predicate), Box::new(on_complete)),
        }
    }

    /// Variant of [`wait_async`](SyncPoint::wait_async) that does not borrow
    /// the sync point, for futures that must be `'static` (the returned
    /// future keeps the point's queue alive).
    pub fn wait_owned(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
    ) -> WaitOwned<T> {
        self.wait_owned_with(predicate, |_, _| {})
    }

    /// Like [`wait_owned`](SyncPoint::wait_owned) with a completion handler.
    pub fn wait_owned_with(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        on_complete: impl FnOnce(&mut T, WaitState) + Send + 'static,
    ) -> WaitOwned<T> {
        WaitOwned {
            point: self.shared.clone(),
            raw: RawWait::new(Box::new(predicate), Box::new(on_complete)),
        }
    }

    /// Cancels an in-flight wait.
    ///
    /// Returns `true` if the record was still waiting: it has been removed
    /// from the queue, its completion handler has observed
    /// [`WaitState::Canceled`], and its waiter has been woken. Returns
    /// `false` if the wait had already reached a terminal state; the race
    /// between cancellation and satisfaction is decided by whichever acquires
    /// the lock first.
    pub fn cancel(&self, handle: &WaitHandle) -> bool {
        self.shared.cancel_record(handle.record())
    }

    /// Runs `f` on the shared state under the lock, then completes every
    /// waiter whose predicate is now satisfied, in FIFO order.
    pub fn trigger(&self, f: impl FnOnce(&mut T)) {
        let _ = self.shared.try_trigger(f);
    }

    /// Runs `f` under the lock; a wake pass over the queue happens only if
    /// `f` returns `true`. When `f` returns `false` no predicates are
    /// evaluated at all.
    pub fn trigger_if(&self, f: impl FnOnce(&mut T) -> bool) {
        let _ = self.shared.try_trigger_if(f);
    }

    /// Runs `f` under the lock and completes at most the returned number of
    /// waiters. A count of `0` suppresses the wake pass entirely, even if
    /// predicates would be satisfied.
    pub fn trigger_n(&self, f: impl FnOnce(&mut T) -> usize) {
        let _ = self.shared.try_trigger_n(f);
    }

    /// Destroys the sync point.
    ///
    /// Every queued waiter is completed with [`WaitState::Destroyed`] (in
    /// FIFO order) and woken before this returns. Subsequent waits complete
    /// immediately with `Destroyed`; subsequent triggers and cancellations
    /// are no-ops. Idempotent.
    pub fn destroy(&self) {
        self.shared.destroy();
    }

    /// Whether [`destroy`](SyncPoint::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Number of records currently queued.
    pub fn waiters(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Runs `f` on the shared state under the same lock predicates and
    /// triggers use. Works regardless of destruction state and performs no
    /// wake pass.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.shared.with(f)
    }

    pub(crate) fn try_trigger(&self, f: impl FnOnce(&mut T)) -> Result<(), Destroyed> {
        self.shared.try_trigger(f)
    }

    pub(crate) fn try_trigger_n(&self, f: impl FnOnce(&mut T) -> usize) -> Result<(), Destroyed> {
        self.shared.try_trigger_n(f)
    }
}

impl<T: Default> Default for SyncPoint<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Drop for SyncPoint<T> {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

impl<T> fmt::Debug for SyncPoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

/// State machine shared by [`Wait`] and [`WaitOwned`].
struct RawWait<T> {
    /// Closures waiting for the first poll; `None` once the wait started.
    query: Option<(Predicate<T>, CompleteFn<T>)>,
    /// Set once the wait protocol ran.
    waiting: Option<(Arc<WaitRecord>, Arc<WakerAgent>)>,
}

// === impl RawWait ===

impl<T> RawWait<T> {
    fn new(predicate: Predicate<T>, on_complete: CompleteFn<T>) -> Self {
        Self {
            query: Some((predicate, on_complete)),
            waiting: None,
        }
    }

    fn poll_wait(&mut self, point: &SharedPoint<T>, cx: &mut Context<'_>) -> Poll<WaitState> {
        if let Some((record, agent)) = &self.waiting {
            let state = record.state();
            if state.is_terminal() {
                return Poll::Ready(state);
            }
            agent.register(cx.waker());
            // The record may have completed while the waker was being
            // swapped in; re-check so that wakeup is not lost.
            let state = record.state();
            if state.is_terminal() {
                Poll::Ready(state)
            } else {
                Poll::Pending
            }
        } else {
            let (predicate, on_complete) = self
                .query
                .take()
                .expect("wait future polled after completion");
            let agent = WakerAgent::new(cx.waker().clone());
            let handle = point.wait_boxed(agent.clone(), predicate, on_complete);
            let state = handle.state();
            self.waiting = Some((Arc::clone(handle.record()), agent));
            if state.is_terminal() {
                Poll::Ready(state)
            } else {
                Poll::Pending
            }
        }
    }

    fn release(&mut self, point: &SharedPoint<T>) {
        if let Some((record, _)) = &self.waiting {
            // No-op unless the record is still queued; cancellation of an
            // abandoned wait runs its completion handler with `Canceled`.
            point.cancel_record(record);
        }
    }
}

/// Future returned by [`SyncPoint::wait_async`], resolving to the wait's
/// terminal [`WaitState`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a, T> {
    point: &'a SharedPoint<T>,
    raw: RawWait<T>,
}

// === impl Wait ===

impl<T> Future for Wait<'_, T> {
    type Output = WaitState;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.raw.poll_wait(this.point, cx)
    }
}

impl<T> Drop for Wait<'_, T> {
    fn drop(&mut self) {
        self.raw.release(self.point);
    }
}

impl<T> fmt::Debug for Wait<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait").finish_non_exhaustive()
    }
}

/// Future returned by [`SyncPoint::wait_owned`].
///
/// Identical to [`Wait`] except that it holds its own reference to the sync
/// point's queue, so it is valid for the `'static` lifetime.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WaitOwned<T> {
    point: SharedPoint<T>,
    raw: RawWait<T>,
}

// === impl WaitOwned ===

impl<T> Future for WaitOwned<T> {
    type Output = WaitState;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.raw.poll_wait(&this.point, cx)
    }
}

impl<T> Drop for WaitOwned<T> {
    fn drop(&mut self) {
        self.raw.release(&self.point);
    }
}

impl<T> fmt::Debug for WaitOwned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitOwned").finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(SyncPoint<()>: Send, Sync);
static_assertions::assert_impl_all!(WaitHandle: Send, Sync);
static_assertions::assert_impl_all!(WaitOwned<()>: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicUsize;
    use crate::loom::sync::mpsc;
    use crate::loom::thread;
    use core::task::Waker;

    /// Test agent that records how the hooks were driven.
    #[derive(Debug, Default)]
    struct ProbeAgent {
        suspends: AtomicUsize,
        wakes: AtomicUsize,
    }

    impl SyncAgent for ProbeAgent {
        fn mark_for_suspend(&self) {
            self.suspends.fetch_add(1, Ordering::Release);
        }

        fn wake(&self) {
            self.wakes.fetch_add(1, Ordering::Release);
        }
    }

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn basic_satisfaction() {
        let _trace = crate::test_util::trace_init();

        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref OBSERVED: AtomicUsize = AtomicUsize::new(0);
            }

            let point = Arc::new(SyncPoint::new(0_i32));

            let waiter = {
                let point = Arc::clone(&point);
                thread::spawn(move || {
                    point.wait(
                        |x| *x == 1,
                        |x, state| {
                            assert_eq!(state, WaitState::PredicateSatisfied);
                            // The trigger's mutation happens-before this
                            // handler runs.
                            assert_eq!(*x, 1);
                            OBSERVED.fetch_add(1, Ordering::Release);
                        },
                    )
                })
            };

            let triggerer = {
                let point = Arc::clone(&point);
                thread::spawn(move || {
                    point.trigger(|x| *x = 1);
                })
            };

            let state = waiter.join().unwrap();
            triggerer.join().unwrap();

            assert_eq!(state, WaitState::PredicateSatisfied);
            assert_eq!(OBSERVED.load(Ordering::Acquire), 1);
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn fifo_with_wake_bound() {
        let point = SyncPoint::new(0_i32);

        let mut w1 = point.wait_async(|x| *x >= 1);
        let mut w2 = point.wait_async(|x| *x >= 1);
        let mut w3 = point.wait_async(|x| *x >= 1);

        assert!(poll_once(&mut w1).is_pending());
        assert!(poll_once(&mut w2).is_pending());
        assert!(poll_once(&mut w3).is_pending());

        point.trigger_n(|x| {
            *x = 1;
            2
        });

        // The two earliest waiters are satisfied, the third keeps its spot
        // and is re-indexed to the front of the queue.
        assert_eq!(poll_once(&mut w1), Poll::Ready(WaitState::PredicateSatisfied));
        assert_eq!(poll_once(&mut w2), Poll::Ready(WaitState::PredicateSatisfied));
        assert!(poll_once(&mut w3).is_pending());

        point.trigger(|_| {});
        assert_eq!(poll_once(&mut w3), Poll::Ready(WaitState::PredicateSatisfied));
    }

    #[cfg(not(loom))]
    #[test]
    fn reindex_after_partial_wake() {
        let point = SyncPoint::new(0_i32);
        let agent = Arc::new(ProbeAgent::default());

        let first = point.wait_with(agent.clone(), |x| *x >= 1, |_, _| {});
        let second = point.wait_with(agent.clone(), |x| *x >= 2, |_, _| {});
        assert_eq!(first.queue_index(), Some(0));
        assert_eq!(second.queue_index(), Some(1));

        point.trigger(|x| *x = 1);

        assert_eq!(first.state(), WaitState::PredicateSatisfied);
        assert_eq!(first.queue_index(), None);
        assert_eq!(second.state(), WaitState::Waiting);
        assert_eq!(second.queue_index(), Some(0));
    }

    #[cfg(not(loom))]
    #[test]
    fn zero_count_trigger_wakes_nobody() {
        let point = SyncPoint::new(0_i32);
        let mut wait = point.wait_async(|x| *x == 1);
        assert!(poll_once(&mut wait).is_pending());

        point.trigger_n(|x| {
            *x = 1;
            0
        });
        assert!(poll_once(&mut wait).is_pending());

        point.trigger(|_| {});
        assert_eq!(poll_once(&mut wait), Poll::Ready(WaitState::PredicateSatisfied));
    }

    #[cfg(not(loom))]
    #[test]
    fn false_conditional_trigger_skips_predicates() {
        let point = SyncPoint::new(());
        let evaluations = Arc::new(AtomicUsize::new(0));

        let probe = Arc::clone(&evaluations);
        let mut wait = point.wait_async(move |()| {
            probe.fetch_add(1, Ordering::Release);
            false
        });
        assert!(poll_once(&mut wait).is_pending());
        let after_enqueue = evaluations.load(Ordering::Acquire);

        point.trigger_if(|()| false);
        assert_eq!(evaluations.load(Ordering::Acquire), after_enqueue);

        point.trigger_if(|()| true);
        assert_eq!(evaluations.load(Ordering::Acquire), after_enqueue + 1);
    }

    #[cfg(not(loom))]
    #[test]
    fn cancel_completes_with_canceled() {
        let point = Arc::new(SyncPoint::new(0_i32));
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let point = Arc::clone(&point);
            thread::spawn(move || {
                let agent = ThreadAgent::for_current();
                let completions = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&completions);
                let handle = point.wait_with(
                    agent.clone(),
                    |x| *x == 1,
                    move |_, state| {
                        assert_eq!(state, WaitState::Canceled);
                        counter.fetch_add(1, Ordering::Release);
                    },
                );
                tx.send(()).unwrap();
                agent.wait();
                assert_eq!(completions.load(Ordering::Acquire), 1);
                (handle.state(), point.cancel(&handle))
            })
        };

        rx.recv().unwrap();
        // The record is queued once the waiter reports in; cancel it from
        // this thread through the shared half (the handle lives on the
        // waiter's stack).
        let record = {
            let locked = point.shared().lock();
            Arc::clone(&locked.queue[0].record)
        };
        assert!(point.shared().cancel_record(&record));

        let (state, cancel_after_terminal) = waiter.join().unwrap();
        assert_eq!(state, WaitState::Canceled);
        // A second cancel after the terminal state reports false.
        assert!(!cancel_after_terminal);
    }

    #[cfg(not(loom))]
    #[test]
    fn cancel_unqueued_record_reports_false() {
        let point = SyncPoint::new(1_i32);
        let agent = Arc::new(ProbeAgent::default());
        // Predicate already true: completes inline, never enqueued.
        let handle = point.wait_with(agent, |x| *x == 1, |_, _| {});
        assert_eq!(handle.state(), WaitState::PredicateSatisfied);
        assert!(!point.cancel(&handle));
    }

    #[cfg(not(loom))]
    #[test]
    fn destroy_completes_queued_waiters() {
        let point = SyncPoint::new(());
        let agent = Arc::new(ProbeAgent::default());
        let completions = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&completions);
        let handle = point.wait_with(agent.clone(), |()| false, move |(), state| {
            assert_eq!(state, WaitState::Destroyed);
            counter.fetch_add(1, Ordering::Release);
        });

        assert_eq!(agent.suspends.load(Ordering::Acquire), 1);
        point.destroy();
        point.destroy();

        assert_eq!(handle.state(), WaitState::Destroyed);
        assert_eq!(handle.queue_index(), None);
        // Exactly one completion and one wake despite the double destroy.
        assert_eq!(completions.load(Ordering::Acquire), 1);
        assert_eq!(agent.wakes.load(Ordering::Acquire), 1);
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_after_destroy_completes_immediately() {
        let point = SyncPoint::new(());
        point.destroy();

        let state = point.wait(|()| false, |(), state| {
            assert_eq!(state, WaitState::Destroyed);
        });
        assert_eq!(state, WaitState::Destroyed);
        assert!(point.is_destroyed());
    }

    #[cfg(not(loom))]
    #[test]
    fn drop_destroys_queued_waiters() {
        let agent = Arc::new(ProbeAgent::default());
        let handle = {
            let point = SyncPoint::new(());
            let handle = point.wait_with(agent.clone(), |()| false, |_, _| {});
            assert_eq!(handle.state(), WaitState::Waiting);
            handle
        };

        assert_eq!(handle.state(), WaitState::Destroyed);
        assert_eq!(agent.wakes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn destroy_during_wait_resumes_thread() {
        crate::loom::model(|| {
            let point = Arc::new(SyncPoint::new(()));
            let (tx, rx) = mpsc::channel();

            let waiter = {
                let point = Arc::clone(&point);
                thread::spawn(move || {
                    let agent = ThreadAgent::for_current();
                    let handle = point.wait_with(agent.clone(), |()| false, |_, _| {});
                    tx.send(()).unwrap();
                    agent.wait();
                    handle.state()
                })
            };

            rx.recv().unwrap();
            point.destroy();

            assert_eq!(waiter.join().unwrap(), WaitState::Destroyed);
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn dropping_pending_wait_future_cancels() {
        let point = SyncPoint::new(());
        let completions = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&completions);
        let mut wait = point.wait_async_with(|()| false, move |(), state| {
            assert_eq!(state, WaitState::Canceled);
            counter.fetch_add(1, Ordering::Release);
        });
        assert!(poll_once(&mut wait).is_pending());
        drop(wait);

        assert_eq!(completions.load(Ordering::Acquire), 1);
        // The queue is empty again; a trigger completes nobody.
        point.trigger(|()| {});
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_future_completes_inline_when_predicate_holds() {
        let point = SyncPoint::new(5_i32);
        let mut wait = point.wait_async(|x| *x == 5);
        assert_eq!(poll_once(&mut wait), Poll::Ready(WaitState::PredicateSatisfied));
        // The future is fused.
        assert_eq!(poll_once(&mut wait), Poll::Ready(WaitState::PredicateSatisfied));
    }

    #[cfg(all(debug_assertions, not(loom)))]
    #[test]
    #[should_panic(expected = "re-entered")]
    fn reentrant_trigger_from_predicate_panics() {
        let point = Arc::new(SyncPoint::new(0_i32));
        let reentrant = Arc::clone(&point);
        let mut wait = point.wait_async(move |_| {
            reentrant.trigger(|x| *x += 1);
            false
        });
        let _ = poll_once(&mut wait);
    }

    // The cancellation/satisfaction race: whichever side takes the lock
    // first decides the terminal state, and exactly one terminal completion
    // is observed.
    #[test]
    fn cancel_trigger_race() {
        let _trace = crate::test_util::trace_init();

        crate::loom::model(|| {
            let point = Arc::new(SyncPoint::new(0_i32));
            let completions = Arc::new(AtomicUsize::new(0));
            let agent = Arc::new(ProbeAgent::default());

            let counter = Arc::clone(&completions);
            let handle = Arc::new(point.wait_with(
                agent.clone(),
                |x| *x == 1,
                move |_, state| {
                    assert!(matches!(
                        state,
                        WaitState::Canceled | WaitState::PredicateSatisfied
                    ));
                    counter.fetch_add(1, Ordering::Release);
                },
            ));
            assert_eq!(handle.state(), WaitState::Waiting);

            let canceler = {
                let point = Arc::clone(&point);
                let handle = Arc::clone(&handle);
                thread::spawn(move || point.cancel(&handle))
            };
            let triggerer = {
                let point = Arc::clone(&point);
                thread::spawn(move || point.trigger(|x| *x = 1))
            };

            let canceled = canceler.join().unwrap();
            triggerer.join().unwrap();

            if canceled {
                assert_eq!(handle.state(), WaitState::Canceled);
            } else {
                assert_eq!(handle.state(), WaitState::PredicateSatisfied);
            }
            assert_eq!(completions.load(Ordering::Acquire), 1);
            assert_eq!(agent.wakes.load(Ordering::Acquire), 1);
        });
    }
}
