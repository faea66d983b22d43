// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resumable units of work scheduled on the [executor] pool.
//!
//! A task is a future whose suspension points are [`SyncPoint`] waits (and
//! anything built on them: [`PredicatedCondition`] waits, [`sleep`],
//! [`yield_now`]). Between suspension points a task owns an executor thread;
//! a blocking OS call inside a task body holds that thread and reduces
//! effective parallelism, so task bodies should block through sync points
//! only.
//!
//! [executor]: crate::executor
//! [`SyncPoint`]: crate::sync::SyncPoint
//! [`PredicatedCondition`]: crate::sync::PredicatedCondition
//! [`sleep`]: crate::time::sleep

use crate::error::{JoinError, WaitError};
use crate::executor;
use crate::sync::{PredicatedCondition, WaitOwned, WaitState};
use core::any::Any;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Wake;

/// Observable lifecycle of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Created but not yet placed in the ready queue.
    Dormant,
    /// In the ready queue, waiting for an executor to pick it up.
    InQueue,
    /// Being polled by an executor thread.
    Running,
    /// Suspended at a sync point, off every executor thread.
    Blocked,
    /// Ran to completion (or panicked); its result is ready.
    Finished,
}

/// Internal run-state machine. `NOTIFIED` is `RUNNING` plus a wake that
/// arrived mid-poll and must turn into a re-enqueue when the poll returns.
mod run_state {
    pub(super) const DORMANT: u8 = 0;
    pub(super) const QUEUED: u8 = 1;
    pub(super) const RUNNING: u8 = 2;
    pub(super) const NOTIFIED: u8 = 3;
    pub(super) const BLOCKED: u8 = 4;
    pub(super) const FINISHED: u8 = 5;
}

/// Identifier unique among currently live tasks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId(u64);

// === impl TaskId ===

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The type-erased heart of a spawned task, shared between the executor's
/// ready queue, the wakers captured at suspension points, and the
/// [`JoinHandle`].
pub(crate) struct TaskCore {
    run_state: AtomicU8,
    /// The suspended continuation. Taken for the duration of a poll; `None`
    /// once the task finished.
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    /// Payload of a panicking body, re-raised (as [`JoinError`]) at join.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
    /// The finished signal joiners wait on.
    finished: PredicatedCondition<bool>,
    id: TaskId,
    span: tracing::Span,
}

pub(crate) type TaskRef = Arc<TaskCore>;

struct TaskWaker(TaskRef);

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        wake_task(&self.0);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        wake_task(&self.0);
    }
}

/// Makes a suspended task runnable again by pushing it back into the pool's
/// ready queue. Safe to call from any thread, including under a sync point's
/// lock (the pool uses a separate sync point).
pub(crate) fn wake_task(core: &TaskRef) {
    use run_state::{BLOCKED, NOTIFIED, QUEUED, RUNNING};

    let mut state = core.run_state.load(Ordering::Acquire);
    loop {
        let (target, reschedule) = match state {
            BLOCKED => (QUEUED, true),
            RUNNING => (NOTIFIED, false),
            // Queued, already notified, finished, or not yet started:
            // nothing to do.
            _ => return,
        };
        match core
            .run_state
            .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if reschedule {
                    tracing::trace!(task = %core.id, "woke blocked task");
                    executor::schedule(Arc::clone(core));
                }
                return;
            }
            Err(actual) => state = actual,
        }
    }
}

/// Polls the task once on the calling executor thread.
pub(crate) fn resume(core: TaskRef) {
    use run_state::{BLOCKED, FINISHED, NOTIFIED, QUEUED, RUNNING};

    let span = core.span.clone();
    let _guard = span.entered();

    core.run_state.store(RUNNING, Ordering::Release);
    let taken = core.future.lock().unwrap_or_else(|e| e.into_inner()).take();
    let Some(mut future) = taken else {
        debug_assert!(false, "resumed a task with no continuation");
        return;
    };

    let waker = Waker::from(Arc::new(TaskWaker(Arc::clone(&core))));
    let mut cx = Context::from_waker(&waker);
    let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

    match poll {
        Ok(Poll::Pending) => {
            // Park the continuation before publishing the Blocked state, so
            // a wake that lands immediately afterwards finds it in place.
            *core.future.lock().unwrap_or_else(|e| e.into_inner()) = Some(future);
            match core.run_state.compare_exchange(
                RUNNING,
                BLOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => tracing::trace!(task = %core.id, "task suspended"),
                Err(actual) => {
                    // A wake arrived while the body was being polled.
                    debug_assert_eq!(actual, NOTIFIED);
                    core.run_state.store(QUEUED, Ordering::Release);
                    executor::schedule(Arc::clone(&core));
                }
            }
        }
        Ok(Poll::Ready(())) => {
            core.run_state.store(FINISHED, Ordering::Release);
            signal_finished(&core);
        }
        Err(payload) => {
            tracing::debug!(task = %core.id, "task body panicked");
            *core.panic.lock().unwrap_or_else(|e| e.into_inner()) = Some(payload);
            core.run_state.store(FINISHED, Ordering::Release);
            signal_finished(&core);
        }
    }
}

fn signal_finished(core: &TaskRef) {
    let _ = core.finished.trigger(|done| *done = true);
    tracing::trace!(task = %core.id, "task finished");
}

/// Spawns `future` as a task on the process-wide executor pool.
///
/// The task starts out [`TaskState::InQueue`]; an executor thread is spawned
/// for it if the pool is below its concurrency bound. The returned
/// [`JoinHandle`] observes completion and carries the output.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Builder::new().spawn(future)
}

/// Configures a task before spawning it.
///
/// Currently the only knob is a debug name, which shows up in the task's
/// tracing span.
#[derive(Debug, Default)]
pub struct Builder<'a> {
    name: Option<&'a str>,
}

// === impl Builder ===

impl<'a> Builder<'a> {
    #[must_use]
    pub const fn new() -> Self {
        Self { name: None }
    }

    /// Names the task. By default tasks are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Spawns `future` with this configuration.
    ///
    /// If the executor pool has been [shut down](crate::executor::shutdown)
    /// the task is created but will never run; join handles for it never
    /// complete (use [`JoinHandle::wait_timeout`] when that matters).
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = TaskId::next();
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = self.name.unwrap_or_default(),
        );

        let output = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&output);
        let body = async move {
            let value = future.await;
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        };

        let core = Arc::new(TaskCore {
            run_state: AtomicU8::new(run_state::DORMANT),
            future: Mutex::new(Some(Box::pin(body))),
            panic: Mutex::new(None),
            finished: PredicatedCondition::new(false),
            id,
            span,
        });

        let handle = JoinHandle {
            core: Arc::clone(&core),
            output,
            wait: None,
        };

        core.run_state.store(run_state::QUEUED, Ordering::Release);
        executor::schedule(core);
        handle
    }
}

/// Owner's view of a spawned task: observe its state, wait for it, and take
/// its output.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<R> {
    core: TaskRef,
    output: Arc<Mutex<Option<R>>>,
    wait: Option<WaitOwned<bool>>,
}

// === impl JoinHandle ===

impl<R> JoinHandle<R> {
    /// The task's identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// A snapshot of the task's lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        match self.core.run_state.load(Ordering::Acquire) {
            run_state::DORMANT => TaskState::Dormant,
            run_state::QUEUED => TaskState::InQueue,
            run_state::RUNNING | run_state::NOTIFIED => TaskState::Running,
            run_state::BLOCKED => TaskState::Blocked,
            run_state::FINISHED => TaskState::Finished,
            state => unreachable!("invalid task state {state}"),
        }
    }

    /// Whether the task has reached [`TaskState::Finished`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Blocks the calling thread until the task finishes. Does not consume
    /// the handle or the task's output.
    pub fn wait(&self) {
        self.core
            .finished
            .wait(|done| *done)
            .expect("task finished signal destroyed while a join handle is live");
    }

    /// Blocks until the task finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] if the task was still running when the
    /// timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        self.core.finished.wait_timeout(|done| *done, timeout)
    }

    /// Blocks until the task finishes and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError`] if the task body panicked; the error carries
    /// the panic payload.
    pub fn join(self) -> Result<R, JoinError> {
        self.wait();
        self.take_result()
    }

    fn take_result(&self) -> Result<R, JoinError> {
        let payload = self
            .core
            .panic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(payload) = payload {
            return Err(JoinError(payload));
        }
        let value = self
            .output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("task output already taken");
        Ok(value)
    }
}

impl<R> Future for JoinHandle<R> {
    type Output = Result<R, JoinError>;

    /// Awaits the task's completion.
    ///
    /// # Panics
    ///
    /// Panics if polled again after returning `Ready`.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.wait.is_none() {
            this.wait = Some(this.core.finished.wait_owned_raw(|done| *done));
        }
        let wait = this.wait.as_mut().expect("wait future just created");

        match Pin::new(wait).poll(cx) {
            Poll::Ready(state) => {
                debug_assert_eq!(state, WaitState::PredicateSatisfied);
                Poll::Ready(this.take_result())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> fmt::Debug for JoinHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Joins every handle in order, collecting the outcomes.
pub fn join_all<R>(handles: impl IntoIterator<Item = JoinHandle<R>>) -> Vec<Result<R, JoinError>> {
    handles.into_iter().map(JoinHandle::join).collect()
}

/// Yields the executor thread back to the pool once, letting other ready
/// tasks run before this one resumes.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await;
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::PredicatedCondition;
    use crate::time;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spawn_and_join() {
        let _trace = crate::test_util::trace_init();

        let handle = spawn(async { 6 * 7 });
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn named_spawn_finishes() {
        let handle = Builder::new().name("answer").spawn(async { 42 });
        handle.wait();
        assert_eq!(handle.state(), TaskState::Finished);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn panic_is_captured_and_rethrown_at_join() {
        let handle = spawn(async {
            panic!("exploded");
        });
        let err = handle.join().unwrap_err();
        assert_eq!(err.panic_message(), Some("exploded"));
    }

    #[test]
    fn task_suspends_on_condition_and_resumes() {
        let cond = Arc::new(PredicatedCondition::new(0_i32));

        let waiter = Arc::clone(&cond);
        let handle = spawn(async move {
            waiter.wait_async(|x| *x >= 1).await.unwrap();
            waiter.with(|x| *x)
        });

        // The predicate is level-triggered: whether the task polls before or
        // after this trigger, it observes the satisfied state.
        cond.trigger(|x| *x = 1).unwrap();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn tasks_interleave_through_yield() {
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                spawn(async move {
                    counter.fetch_add(1, Ordering::Release);
                    yield_now().await;
                    counter.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        for result in join_all(handles) {
            result.unwrap();
        }
        assert_eq!(counter.load(Ordering::Acquire), 16);
    }

    #[test]
    fn join_handle_is_a_future() {
        let handle = spawn(async {
            time::sleep(Duration::from_millis(10)).await;
            "done"
        });
        assert_eq!(futures::executor::block_on(handle).unwrap(), "done");
    }

    #[test]
    fn wait_timeout_on_stuck_task() {
        let cond = Arc::new(PredicatedCondition::new(false));

        let waiter = Arc::clone(&cond);
        let handle = spawn(async move {
            waiter.wait_async(|ready| *ready).await.unwrap();
        });

        assert_eq!(
            handle.wait_timeout(Duration::from_millis(50)),
            Err(WaitError::Timeout)
        );

        cond.trigger(|ready| *ready = true).unwrap();
        handle.join().unwrap();
    }
}
