// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide executor pool.
//!
//! A small set of detached OS threads pops ready tasks from a global FIFO
//! queue and resumes them. The queue, the live-executor count, and the
//! shutdown flag all live inside one dedicated [`SyncPoint`]: executors are
//! themselves just predicate-waiters on it, and scheduling a task is just a
//! count-returning trigger. The pool therefore exercises the exact protocol
//! it exists to serve.
//!
//! Executor threads are spawned on demand, up to `hardware_concurrency + 2`,
//! whenever a task becomes ready and every live executor is presumed busy.
//! Idle executors park inside the pool sync point's wait; they exit only
//! when the pool is [shut down](shutdown).

use crate::sync::{SyncPoint, ThreadAgent, WaitState};
use crate::task::{self, TaskRef};
use lazy_static::lazy_static;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Default)]
struct PoolState {
    ready: VecDeque<TaskRef>,
    live_executors: usize,
    peak_executors: usize,
    next_executor_id: usize,
}

lazy_static! {
    static ref POOL: SyncPoint<PoolState> = SyncPoint::new(PoolState::default());
    static ref MAX_CONCURRENCY: usize = thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        + 2;
}

/// The maximum number of executor threads the pool will run,
/// `hardware_concurrency + 2`.
#[must_use]
pub fn concurrency_bound() -> usize {
    *MAX_CONCURRENCY
}

/// Number of currently live executor threads.
#[must_use]
pub fn executor_count() -> usize {
    POOL.with(|pool| pool.live_executors)
}

/// High-water mark of live executor threads over the life of the process.
#[must_use]
pub fn peak_executor_count() -> usize {
    POOL.with(|pool| pool.peak_executors)
}

/// Destroys the pool's sync point: every idle executor observes a
/// `Destroyed` outcome, retires, and exits; busy executors exit after their
/// current task suspends or completes. Queued tasks are dropped on the
/// floor and tasks scheduled afterwards never run.
///
/// Intended for orderly tear-down at process exit; there is no way to
/// restart the pool afterwards.
pub fn shutdown() {
    tracing::debug!("shutting down executor pool");
    POOL.destroy();
    // The drain completed the waits of the *idle* executors; the queue is
    // cleared too, so busy ones come back to a destroyed pool and retire.
    POOL.with(|pool| pool.ready.clear());
}

/// Whether [`shutdown`] has been called.
#[must_use]
pub fn is_shut_down() -> bool {
    POOL.is_destroyed()
}

/// Pushes a ready task and, atomically with the push, spawns a new executor
/// thread if the ready backlog calls for one. No-op after [`shutdown`].
pub(crate) fn schedule(task: TaskRef) {
    POOL.trigger_n(move |pool| {
        pool.ready.push_back(task);
        let ready = pool.ready.len();
        if ready <= *MAX_CONCURRENCY && pool.live_executors < ready {
            spawn_executor(pool);
        }
        // The wake bound: every executor that can pop something gets woken.
        ready
    });
}

fn spawn_executor(pool: &mut PoolState) {
    let id = pool.next_executor_id;
    pool.next_executor_id += 1;

    let spawned = thread::Builder::new()
        .name(format!("tasksync-executor-{id}"))
        .spawn(move || run_executor(id));

    match spawned {
        Ok(_detached) => {
            pool.live_executors += 1;
            pool.peak_executors = pool.peak_executors.max(pool.live_executors);
            tracing::debug!(executor = id, live = pool.live_executors, "spawned executor");
        }
        Err(err) => {
            // Ready tasks will be picked up by the existing executors.
            tracing::error!(executor = id, "failed to spawn executor thread: {err}");
        }
    }
}

fn run_executor(id: usize) {
    let _span = tracing::debug_span!("executor main loop", executor = id).entered();

    loop {
        let agent = ThreadAgent::for_current();
        let slot: Arc<Mutex<Option<TaskRef>>> = Arc::new(Mutex::new(None));

        let popped = Arc::clone(&slot);
        let handle = POOL.wait_with(
            agent.clone(),
            |pool| !pool.ready.is_empty(),
            move |pool, outcome| {
                if outcome == WaitState::PredicateSatisfied {
                    *popped.lock().unwrap_or_else(|e| e.into_inner()) = pool.ready.pop_front();
                } else {
                    // Retire inside the sync point's critical section so the
                    // count stays consistent with the destroy pass.
                    pool.live_executors -= 1;
                }
            },
        );
        agent.wait();

        if handle.state() != WaitState::PredicateSatisfied {
            tracing::debug!(executor = id, "pool destroyed, shutting down");
            break;
        }

        let taken = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = taken.expect("executor predicate held without a ready task");
        task::resume(task);
    }
}
