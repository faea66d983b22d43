// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Destroyed, WaitError};
use crate::sync::agent::ThreadAgent;
use crate::sync::point::{SyncPoint, WaitOwned, WaitState};
use crate::time::Timer;
use core::fmt;
use core::time::Duration;

/// A condition synchronization primitive over guarded data, with wakeup
/// predicates chosen by the waiters.
///
/// `PredicatedCondition<T>` is a façade over a [`SyncPoint<T>`] that adds the
/// pieces threads usually want on top of the raw protocol:
///
/// - waits that block the calling thread and report their outcome as a
///   [`Result`] instead of a raw [`WaitState`];
/// - waits with a timeout, armed on the global timer service;
/// - a distinguished [`WaitError::AlreadyDestroyed`] / [`Destroyed`] error
///   for operations attempted after destruction, so "the object is gone" is
///   distinguishable from "it went away while I was waiting";
/// - destruction on drop.
///
/// Unlike a `std::sync::Condvar` there is no external mutex to manage and no
/// spurious wakeup to re-check for: predicates are evaluated inside trigger
/// calls, under the same lock that guards the data, and a waiter only resumes
/// once its predicate held (or the wait failed terminally).
///
/// The primitive is level-triggered: a trigger completes every waiter whose
/// predicate holds *now*, regardless of which mutation made it true. Edge
/// semantics, when needed, belong in the predicate (for example by consuming
/// the state it tests, as [`Condition::reset`] does).
///
/// The re-entrancy rules of [`SyncPoint`] apply: predicates, completion
/// handlers, and trigger mutators must not call back into this condition.
pub struct PredicatedCondition<T> {
    point: SyncPoint<T>,
}

// === impl PredicatedCondition ===

impl<T: Send + 'static> PredicatedCondition<T> {
    /// Creates a condition guarding `state`.
    pub fn new(state: T) -> Self {
        Self {
            point: SyncPoint::new(state),
        }
    }

    /// Mutates the guarded state under the lock, then completes every waiter
    /// whose predicate the mutation satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`Destroyed`] if the condition has been destroyed; `f` is not
    /// run in that case.
    pub fn trigger(&self, f: impl FnOnce(&mut T)) -> Result<(), Destroyed> {
        self.point.try_trigger(f)
    }

    /// Like [`trigger`](PredicatedCondition::trigger), completing at most
    /// `max_wake_count` waiters. A bound of `0` runs the mutation but wakes
    /// nobody.
    ///
    /// # Errors
    ///
    /// Returns [`Destroyed`] if the condition has been destroyed; `f` is not
    /// run in that case.
    pub fn trigger_limited(
        &self,
        f: impl FnOnce(&mut T),
        max_wake_count: usize,
    ) -> Result<(), Destroyed> {
        self.point.try_trigger_n(|state| {
            f(state);
            max_wake_count
        })
    }

    /// Blocks until a trigger satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// - [`WaitError::AlreadyDestroyed`] if the condition was destroyed
    ///   before the wait started.
    /// - [`WaitError::Destroyed`] if it was destroyed while waiting.
    pub fn wait(&self, predicate: impl FnMut(&mut T) -> bool + Send + 'static) -> Result<(), WaitError> {
        self.wait_with(predicate, |_, _| {})
    }

    /// Blocks until a trigger satisfies `predicate`; `handler` runs under the
    /// lock, atomically with the terminal state transition.
    ///
    /// # Errors
    ///
    /// - [`WaitError::AlreadyDestroyed`] if the condition was destroyed
    ///   before the wait started.
    /// - [`WaitError::Destroyed`] if it was destroyed while waiting.
    pub fn wait_with(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        handler: impl FnOnce(&mut T, WaitState) + Send + 'static,
    ) -> Result<(), WaitError> {
        if self.point.is_destroyed() {
            return Err(WaitError::AlreadyDestroyed);
        }
        Self::map_outcome(self.point.wait(predicate, handler))
    }

    /// Blocks until a trigger satisfies `predicate` or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Timeout`] if the timeout elapsed first.
    /// - [`WaitError::AlreadyDestroyed`] / [`WaitError::Destroyed`] as for
    ///   [`wait`](PredicatedCondition::wait).
    pub fn wait_timeout(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.wait_timeout_with(predicate, |_, _| {}, timeout)
    }

    /// Timeout wait with a completion handler.
    ///
    /// The timer is armed after the record is enqueued but before the caller
    /// blocks. When it fires it takes the sync point's lock: a record still
    /// waiting is spliced out and completed with [`WaitState::Timeout`]; a
    /// record that already completed is left alone. Stopping the timer when
    /// satisfaction wins the race is best-effort; the check under the lock
    /// is the source of truth.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Timeout`] if the timeout elapsed first.
    /// - [`WaitError::AlreadyDestroyed`] / [`WaitError::Destroyed`] as for
    ///   [`wait`](PredicatedCondition::wait).
    pub fn wait_timeout_with(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
        handler: impl FnOnce(&mut T, WaitState) + Send + 'static,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        if self.point.is_destroyed() {
            return Err(WaitError::AlreadyDestroyed);
        }

        let agent = ThreadAgent::for_current();
        let handle = self.point.wait_with(agent.clone(), predicate, handler);

        if handle.state() == WaitState::Waiting {
            let shared = self.point.shared().clone();
            let record = handle.record().clone();
            let timer = Timer::new(move || {
                shared.expire_record(&record);
            });
            timer.one_shot(timeout);
            agent.wait();
            timer.stop();
        }

        Self::map_outcome(handle.state())
    }

    /// Waits for `predicate` without blocking the executor thread.
    ///
    /// This is the wait form task bodies use. To bound it in time, wrap the
    /// returned future in [`crate::time::timeout`].
    ///
    /// # Errors
    ///
    /// - [`WaitError::AlreadyDestroyed`] if the condition was destroyed
    ///   before the wait started.
    /// - [`WaitError::Destroyed`] if it was destroyed while waiting.
    pub async fn wait_async(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
    ) -> Result<(), WaitError> {
        if self.point.is_destroyed() {
            return Err(WaitError::AlreadyDestroyed);
        }
        Self::map_outcome(self.point.wait_async(predicate).await)
    }

    /// Runs `f` on the guarded state under the same lock predicates and
    /// triggers use. Works regardless of destruction state; no waiters are
    /// woken.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.point.with(f)
    }

    /// Destroys the condition: every current waiter completes with a
    /// [`WaitError::Destroyed`] outcome before this returns, and every later
    /// operation fails with the distinguished post-destruction error.
    /// Idempotent, and invoked automatically on drop.
    pub fn destroy(&self) {
        self.point.destroy();
    }

    /// Whether the condition has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.point.is_destroyed()
    }

    pub(crate) fn wait_owned_raw(
        &self,
        predicate: impl FnMut(&mut T) -> bool + Send + 'static,
    ) -> WaitOwned<T> {
        self.point.wait_owned(predicate)
    }

    #[cfg(test)]
    pub(crate) fn point(&self) -> &SyncPoint<T> {
        &self.point
    }

    fn map_outcome(state: WaitState) -> Result<(), WaitError> {
        match state {
            WaitState::PredicateSatisfied => Ok(()),
            WaitState::Timeout => Err(WaitError::Timeout),
            WaitState::Destroyed => Err(WaitError::Destroyed),
            state => unreachable!("predicated condition wait completed with {state:?}"),
        }
    }
}

impl<T: Send + Default + 'static> Default for PredicatedCondition<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for PredicatedCondition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicatedCondition")
            .finish_non_exhaustive()
    }
}

/// A manual-reset condition cooperative with the tasking system.
///
/// Either *triggered* or *reset*. While triggered, waits return immediately;
/// while reset, they block until the condition is triggered or destroyed.
pub struct Condition {
    inner: PredicatedCondition<bool>,
}

// === impl Condition ===

impl Condition {
    /// Creates a condition in the reset state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: PredicatedCondition::new(false),
        }
    }

    /// Puts the condition in the triggered state, releasing all waiters.
    ///
    /// # Errors
    ///
    /// Returns [`Destroyed`] if the condition has been destroyed.
    pub fn trigger(&self) -> Result<(), Destroyed> {
        self.inner.trigger(|set| *set = true)
    }

    /// Returns the condition to the reset state without waking anyone.
    ///
    /// # Errors
    ///
    /// Returns [`Destroyed`] if the condition has been destroyed.
    pub fn reset(&self) -> Result<(), Destroyed> {
        self.inner.trigger_limited(|set| *set = false, 0)
    }

    /// Whether a wait would return immediately.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.with(|set| *set)
    }

    /// Blocks until the condition is triggered.
    ///
    /// # Errors
    ///
    /// See [`PredicatedCondition::wait`].
    pub fn wait(&self) -> Result<(), WaitError> {
        self.inner.wait(|set| *set)
    }

    /// Blocks until the condition is triggered or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// See [`PredicatedCondition::wait_timeout`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        self.inner.wait_timeout(|set| *set, timeout)
    }

    /// Waits for the trigger without blocking the executor thread.
    ///
    /// # Errors
    ///
    /// See [`PredicatedCondition::wait_async`].
    pub async fn wait_async(&self) -> Result<(), WaitError> {
        self.inner.wait_async(|set| *set).await
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
