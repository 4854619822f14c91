//! Timer subsystem: deadline-scheduled resumptions.
//!
//! A dedicated timer thread owns a [`TimerQueue`] (heap plus no-allocation
//! overflow list). Submitters hand entries over through a lock-free queue
//! and wake the thread; the thread sleeps until the earliest deadline or
//! the next wake, whichever comes first, then moves due and cancelled
//! entries out and schedules their resumptions through the service.
//!
//! # The refcount handoff
//!
//! Between the submitting thread pushing an entry and its final bookkeeping
//! there is a window in which the timer thread could fire the entry, have
//! it resumed on an I/O worker, and see the whole await finish. Each entry
//! therefore starts with a reference count of 2; the submitter and the
//! timer thread each decrement once, and whichever side reaches zero owns
//! scheduling the resumption. Entry states only move forward:
//! `queued → scheduled`, never back.
//!
//! # Ownership
//!
//! The service solely owns the timer thread (started lazily on first use,
//! joined when the service drops); the thread holds only a weak service
//! reference, so the pair cannot keep each other alive.

mod queue;

use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{Error, Result};
use crate::service::Shared;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use queue::TimerQueue;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::Instant;

const STATE_QUEUED: u8 = 0;
const STATE_SCHEDULED: u8 = 1;

/// A deadline-scheduled resumption, shared between the submitting caller
/// and the timer thread.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) token: CancelToken,
    state: AtomicU8,
    refcount: AtomicU32,
    waker: Mutex<Option<Waker>>,
    /// Overflow-list link; touched only by the timer thread.
    pub(crate) next: Mutex<Option<Arc<TimerEntry>>>,
}

impl TimerEntry {
    fn new(deadline: Instant, token: CancelToken, waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            token,
            state: AtomicU8::new(STATE_QUEUED),
            refcount: AtomicU32::new(2),
            waker: Mutex::new(Some(waker)),
            next: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(deadline: Instant, token: CancelToken) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            token,
            state: AtomicU8::new(STATE_QUEUED),
            refcount: AtomicU32::new(2),
            waker: Mutex::new(None),
            next: Mutex::new(None),
        })
    }

    fn is_scheduled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SCHEDULED
    }

    fn mark_scheduled(&self) {
        self.state.store(STATE_SCHEDULED, Ordering::Release);
    }

    fn store_waker(&self, waker: Waker) {
        *self.waker.lock() = Some(waker);
    }

    fn take_waker(&self) -> Option<Waker> {
        self.waker.lock().take()
    }

    /// Drops one of the two references; true means this side reached zero
    /// and owns scheduling the resumption.
    fn release_ref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

/// State shared between the timer thread and its submitters.
pub(crate) struct TimerShared {
    /// Lock-free handoff of newly queued entries.
    newly_queued: SegQueue<Arc<TimerEntry>>,
    /// Coalesced cancellation-scan request.
    cancel_requested: AtomicBool,
    shutdown: AtomicBool,
    wake_flag: Mutex<bool>,
    wake_cv: Condvar,
    service: Weak<Shared>,
}

impl TimerShared {
    /// Starts the timer thread. The service keeps the join handle; the
    /// thread keeps only the weak service reference.
    pub(crate) fn spawn(service: Weak<Shared>) -> (Arc<Self>, JoinHandle<()>) {
        let shared = Arc::new(Self {
            newly_queued: SegQueue::new(),
            cancel_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake_flag: Mutex::new(false),
            wake_cv: Condvar::new(),
            service,
        });
        let runner = shared.clone();
        let join = std::thread::Builder::new()
            .name("ioloom-timer".into())
            .spawn(move || runner.run())
            .expect("spawning timer thread");
        (shared, join)
    }

    /// Asks the thread to scan for cancelled timers. Coalesced: only the
    /// first request since the last scan wakes the thread.
    pub(crate) fn request_timer_cancellation(&self) {
        if !self.cancel_requested.swap(true, Ordering::AcqRel) {
            self.wake_up();
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake_up();
    }

    fn enqueue(&self, entry: Arc<TimerEntry>) {
        self.newly_queued.push(entry);
        self.wake_up();
    }

    fn wake_up(&self) {
        let mut woken = self.wake_flag.lock();
        *woken = true;
        self.wake_cv.notify_one();
    }

    fn run(&self) {
        let mut queue = TimerQueue::new();
        let mut ready: Vec<Arc<TimerEntry>> = Vec::new();

        loop {
            {
                let mut woken = self.wake_flag.lock();
                while !*woken && !self.shutdown.load(Ordering::Relaxed) {
                    match queue.earliest_due_time() {
                        Some(due) => {
                            if Instant::now() >= due {
                                break;
                            }
                            if self.wake_cv.wait_until(&mut woken, due).timed_out() {
                                break;
                            }
                        }
                        None => self.wake_cv.wait(&mut woken),
                    }
                }
                *woken = false;
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if self.cancel_requested.swap(false, Ordering::AcqRel) {
                queue.remove_cancelled_timers(&mut ready);
            }

            while let Some(entry) = self.newly_queued.pop() {
                if entry.token.is_cancellation_requested() {
                    ready.push(entry);
                } else {
                    queue.enqueue_timer(entry);
                }
            }

            queue.dequeue_due_timers(Instant::now(), &mut ready);

            for entry in ready.drain(..) {
                self.schedule_entry(entry);
            }
        }

        // Teardown: resume every remaining timer rather than stranding its
        // caller; the service is going away.
        tracing::debug!("timer thread shutting down");
        while let Some(entry) = self.newly_queued.pop() {
            ready.push(entry);
        }
        queue.drain_all(&mut ready);
        for entry in ready.drain(..) {
            self.schedule_entry(entry);
        }
    }

    /// Timer-thread side of the refcount handoff.
    fn schedule_entry(&self, entry: Arc<TimerEntry>) {
        entry.mark_scheduled();
        if entry.release_ref() {
            if let Some(waker) = entry.take_waker() {
                match self.service.upgrade() {
                    Some(service) => service.schedule_waker(waker),
                    // Service already gone: wake the caller directly.
                    None => waker.wake(),
                }
            }
        }
    }
}

/// Awaitable resumption at or after a deadline.
///
/// Created by [`IoService::schedule_at`](crate::IoService::schedule_at)
/// and [`schedule_after`](crate::IoService::schedule_after). Resolves to
/// `Ok(())` once the deadline passes, or to [`Error::cancelled`] if the
/// token fires first.
#[must_use = "futures do nothing unless awaited"]
pub struct TimedScheduleOp {
    shared: Arc<Shared>,
    deadline: Instant,
    token: CancelToken,
    entry: Option<Arc<TimerEntry>>,
    registration: Option<CancelRegistration>,
    done: bool,
}

impl TimedScheduleOp {
    pub(crate) fn new(shared: Arc<Shared>, deadline: Instant, token: CancelToken) -> Self {
        Self {
            shared,
            deadline,
            token,
            entry: None,
            registration: None,
            done: false,
        }
    }

    fn finish(&mut self) -> Poll<Result<()>> {
        // Verdict first, registration release second, result last.
        let cancelled = self.token.is_cancellation_requested();
        self.registration = None;
        self.done = true;
        if cancelled {
            Poll::Ready(Err(Error::cancelled()))
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

impl Future for TimedScheduleOp {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "TimedScheduleOp polled after completion");

        if let Some(entry) = this.entry.clone() {
            if entry.is_scheduled() {
                return this.finish();
            }
            entry.store_waker(cx.waker().clone());
            // Re-check after publishing the fresh waker.
            if entry.is_scheduled() {
                return this.finish();
            }
            return Poll::Pending;
        }

        // An already-cancelled token never reaches the timer thread.
        if this.token.is_cancellation_requested() {
            this.done = true;
            return Poll::Ready(Err(Error::cancelled()));
        }

        let timer = Shared::ensure_timer(&this.shared);
        let entry = TimerEntry::new(this.deadline, this.token.clone(), cx.waker().clone());

        if this.token.can_be_cancelled() {
            let timer = timer.clone();
            this.registration = Some(
                this.token
                    .register(move || timer.request_timer_cancellation()),
            );
        }

        timer.enqueue(entry.clone());

        // Submitter side of the refcount handoff: the timer thread may
        // already have fired the entry between the push above and here.
        if entry.release_ref() {
            if let Some(waker) = entry.take_waker() {
                this.shared.schedule_waker(waker);
            }
        }

        this.entry = Some(entry);
        Poll::Pending
    }
}
