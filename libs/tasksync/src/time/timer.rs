// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use lazy_static::lazy_static;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A timer whose callback fires on the shared timer service thread.
///
/// Supports one-shot and interval operation. The callback runs on the
/// service thread with no service-internal lock held, so it may freely take
/// a [`SyncPoint`]'s lock, which is what the [`PredicatedCondition`] timeout
/// path does.
///
/// Arming, [`stop`], and re-arming are generation-counted: fires scheduled
/// by a previous arming are discarded, so a stopped timer never runs its
/// callback late. Stopping is best-effort with respect to a fire that is
/// already in progress.
///
/// [`SyncPoint`]: crate::sync::SyncPoint
/// [`PredicatedCondition`]: crate::sync::PredicatedCondition
/// [`stop`]: Timer::stop
pub struct Timer {
    core: Arc<TimerCore>,
}

struct TimerCore {
    callback: Mutex<Box<dyn FnMut() + Send>>,
    /// Bumped on every arm and stop; a scheduled fire is valid only while
    /// its recorded generation is current.
    generation: AtomicU64,
    armed: AtomicBool,
}

// === impl Timer ===

impl Timer {
    /// Creates a timer that runs `callback` when it fires. The timer starts
    /// out disarmed.
    pub fn new(callback: impl FnMut() + Send + 'static) -> Self {
        Self {
            core: Arc::new(TimerCore {
                callback: Mutex::new(Box::new(callback)),
                generation: AtomicU64::new(0),
                armed: AtomicBool::new(false),
            }),
        }
    }

    /// Fires the callback once after `delay`. Replaces any previous arming.
    pub fn one_shot(&self, delay: Duration) {
        self.arm(delay, None);
    }

    /// Fires the callback every `interval`, starting one interval from now.
    /// Replaces any previous arming.
    pub fn start(&self, interval: Duration) {
        self.arm(interval, Some(interval));
    }

    /// Disarms the timer. Fires already scheduled are discarded when they
    /// come due.
    pub fn stop(&self) {
        self.core.generation.fetch_add(1, Ordering::SeqCst);
        self.core.armed.store(false, Ordering::Release);
    }

    /// Whether the timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.armed.load(Ordering::Acquire)
    }

    fn arm(&self, delay: Duration, period: Option<Duration>) {
        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.armed.store(true, Ordering::Release);
        tracing::trace!(?delay, periodic = period.is_some(), "arming timer");
        service().schedule(Scheduled {
            deadline: Instant::now() + delay,
            seq: 0,
            core: Arc::clone(&self.core),
            generation,
            period,
        });
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// An armed fire in the service's heap.
struct Scheduled {
    deadline: Instant,
    /// Insertion order, to break deadline ties first-armed-first.
    seq: u64,
    core: Arc<TimerCore>,
    generation: u64,
    period: Option<Duration>,
}

// === impl Scheduled ===

impl Scheduled {
    fn is_current(&self) -> bool {
        self.core.generation.load(Ordering::SeqCst) == self.generation
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so that `BinaryHeap`, a max-heap, yields the earliest
    // deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerService {
    shared: Arc<ServiceShared>,
}

struct ServiceShared {
    state: Mutex<ServiceState>,
    cv: Condvar,
}

struct ServiceState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

lazy_static! {
    static ref SERVICE: TimerService = TimerService::start();
}

fn service() -> &'static TimerService {
    &SERVICE
}

// === impl TimerService ===

impl TimerService {
    fn start() -> Self {
        let shared = Arc::new(ServiceShared {
            state: Mutex::new(ServiceState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            cv: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("tasksync-timer".into())
            .spawn(move || run(&worker))
            .expect("failed to spawn the timer service thread");

        Self { shared }
    }

    fn schedule(&self, mut scheduled: Scheduled) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        scheduled.seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(scheduled);
        self.shared.cv.notify_one();
    }
}

fn run(shared: &ServiceShared) {
    let _span = tracing::debug_span!("timer service").entered();
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

    loop {
        let now = Instant::now();

        while state.heap.peek().is_some_and(|s| s.deadline <= now) {
            let Some(due) = state.heap.pop() else { break };
            if !due.is_current() {
                continue;
            }

            // Fire with the service lock released: the callback may take
            // arbitrary sync point locks.
            drop(state);
            {
                let mut callback = due.core.callback.lock().unwrap_or_else(|e| e.into_inner());
                (*callback)();
            }
            state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

            match due.period {
                Some(period) if due.is_current() => {
                    let rearmed = Scheduled {
                        deadline: due.deadline + period,
                        seq: state.next_seq,
                        core: Arc::clone(&due.core),
                        generation: due.generation,
                        period: due.period,
                    };
                    state.next_seq += 1;
                    state.heap.push(rearmed);
                }
                _ => {
                    if due.is_current() {
                        due.core.armed.store(false, Ordering::Release);
                    }
                }
            }
        }

        let next_due = state
            .heap
            .peek()
            .map(|next| next.deadline.saturating_duration_since(Instant::now()));
        state = match next_due {
            Some(wait) => {
                let (guard, _timed_out) = shared
                    .cv
                    .wait_timeout(state, wait)
                    .unwrap_or_else(|e| e.into_inner());
                guard
            }
            None => shared.cv.wait(state).unwrap_or_else(|e| e.into_inner()),
        };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            counter.fetch_add(1, Ordering::Release);
        });

        let start = Instant::now();
        timer.one_shot(Duration::from_millis(20));
        assert!(timer.is_running());

        while fired.load(Ordering::Acquire) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!timer.is_running());

        // One-shot means once.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }

    #[test]
    fn stop_cancels_pending_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            counter.fetch_add(1, Ordering::Release);
        });

        timer.one_shot(Duration::from_millis(30));
        timer.stop();
        assert!(!timer.is_running());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::Acquire), 0);
    }

    #[test]
    fn interval_fires_repeatedly() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            counter.fetch_add(1, Ordering::Release);
        });

        timer.start(Duration::from_millis(10));
        let start = Instant::now();
        while fired.load(Ordering::Acquire) < 3 {
            assert!(start.elapsed() < Duration::from_secs(5), "interval stalled");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(timer.is_running());
        timer.stop();

        let after_stop = fired.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(60));
        // A fire may have been in flight while stopping; after that, silence.
        assert!(fired.load(Ordering::Acquire) <= after_stop + 1);
    }

    #[test]
    fn rearming_supersedes_previous_schedule() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            counter.fetch_add(1, Ordering::Release);
        });

        timer.one_shot(Duration::from_millis(10));
        timer.one_shot(Duration::from_millis(200));

        thread::sleep(Duration::from_millis(60));
        // The first arming was invalidated by the second.
        assert_eq!(fired.load(Ordering::Acquire), 0);

        let start = Instant::now();
        while fired.load(Ordering::Acquire) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "rearmed timer never fired");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }
}
