// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::thread::{self, Thread};
use core::task::Waker;
// Plain `std` Arc even under loom: the model cares about the flag and the
// park/unpark pair, not the handle's reference counts (and loom's `Arc`
// cannot be coerced to a trait object).
use std::sync::Arc;

/// The suspension seam between a [`SyncPoint`] and the execution context that
/// is waiting on it.
///
/// A `SyncAgent` adapts one concurrency substrate (an OS thread, a spawned
/// task's waker, an executor's idle loop) to the sync point's wait protocol.
/// The sync point calls [`mark_for_suspend`] under its lock when a record is
/// enqueued, and [`wake`] under its lock when the record reaches a terminal
/// state. How the waiter actually blocks in between is the agent's business.
///
/// Both hooks run while the sync point's lock is held and must not block, and
/// must not call back into the same sync point. [`wake`] is invoked exactly
/// once per suspension and must be safe to call immediately after
/// [`mark_for_suspend`], including before the waiter has started blocking.
///
/// [`SyncPoint`]: crate::sync::SyncPoint
/// [`mark_for_suspend`]: SyncAgent::mark_for_suspend
/// [`wake`]: SyncAgent::wake
pub trait SyncAgent: Send + Sync {
    /// The waiter is about to be suspended. Must not block.
    fn mark_for_suspend(&self);

    /// Make the waiter runnable again.
    fn wake(&self);
}

/// Blocking adapter that lets a plain OS thread participate in the
/// [`SyncPoint`] protocol.
///
/// [`mark_for_suspend`] clears a flag, [`wake`] sets it and unparks the
/// owning thread, and [`wait`] blocks the thread until the flag is set
/// again. The flag starts set, so a wait whose record completed without ever
/// suspending returns immediately.
///
/// [`SyncPoint`]: crate::sync::SyncPoint
/// [`mark_for_suspend`]: SyncAgent::mark_for_suspend
/// [`wake`]: SyncAgent::wake
/// [`wait`]: ThreadAgent::wait
#[derive(Debug)]
pub struct ThreadAgent {
    ready: AtomicBool,
    thread: Thread,
}

// === impl ThreadAgent ===

impl ThreadAgent {
    /// Creates an agent bound to the calling thread.
    pub fn for_current() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            thread: thread::current(),
        })
    }

    /// Blocks the calling thread until the wait completes.
    ///
    /// This is the client-side half of the protocol: callers pass the agent
    /// to [`SyncPoint::wait_with`] and then block here. Spurious unparks are
    /// absorbed by re-checking the flag.
    ///
    /// [`SyncPoint::wait_with`]: crate::sync::SyncPoint::wait_with
    pub fn wait(&self) {
        while !self.ready.load(Ordering::Acquire) {
            tracing::trace!("parking current thread ({:?})...", self.thread);
            thread::park();
        }
    }
}

impl SyncAgent for ThreadAgent {
    fn mark_for_suspend(&self) {
        self.ready.store(false, Ordering::Release);
    }

    fn wake(&self) {
        self.ready.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Adapter backing the [`Wait`]/[`WaitOwned`] futures: suspension is simply
/// returning `Poll::Pending`, waking means invoking the task's registered
/// [`Waker`].
///
/// [`Wait`]: crate::sync::Wait
/// [`WaitOwned`]: crate::sync::WaitOwned
#[derive(Debug)]
pub(crate) struct WakerAgent {
    waker: Mutex<Option<Waker>>,
}

// === impl WakerAgent ===

impl WakerAgent {
    pub(crate) fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            waker: Mutex::new(Some(waker)),
        })
    }

    /// Replace the registered waker if the new one wakes a different task.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *slot {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }
}

impl SyncAgent for WakerAgent {
    fn mark_for_suspend(&self) {
        // Returning `Poll::Pending` is the suspension; the waker was
        // registered before the record was enqueued.
    }

    fn wake(&self) {
        let waker = self
            .waker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
