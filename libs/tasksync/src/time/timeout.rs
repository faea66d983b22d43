// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Elapsed;
use crate::time::Timer;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use pin_project::pin_project;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Completes after `duration` has elapsed, driven by the timer service.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        timer: None,
        shared: Arc::new(SleepShared {
            fired: AtomicBool::new(false),
            waker: Mutex::new(None),
        }),
    }
}

/// Future returned by [`sleep`].
///
/// The underlying timer is armed on first poll and disarmed when the future
/// is dropped.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    duration: Duration,
    timer: Option<Timer>,
    shared: Arc<SleepShared>,
}

struct SleepShared {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

// === impl Sleep ===

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.shared.fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }

        {
            let mut slot = this.shared.waker.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *slot {
                Some(current) if current.will_wake(cx.waker()) => {}
                _ => *slot = Some(cx.waker().clone()),
            }
        }

        if this.timer.is_none() {
            let shared = Arc::clone(&this.shared);
            let timer = Timer::new(move || {
                shared.fired.store(true, Ordering::Release);
                let waker = shared.waker.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            timer.one_shot(this.duration);
            this.timer = Some(timer);
        }

        // The timer may have fired while the waker was being swapped in.
        if this.shared.fired.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl core::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sleep")
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Requires a future to complete before `duration` has elapsed.
pub fn timeout<F>(duration: Duration, future: F) -> Timeout<F::IntoFuture>
where
    F: IntoFuture,
{
    Timeout {
        sleep: sleep(duration),
        future: future.into_future(),
    }
}

/// Future returned by [`timeout`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    sleep: Sleep,
    #[pin]
    future: F,
}

// === impl Timeout ===

impl<F> Timeout<F> {
    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        if let Poll::Ready(v) = me.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }

        match me.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
