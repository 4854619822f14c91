//! I/O service and event loop.
//!
//! [`IoService`] owns one reactor backend, a count of outstanding work, a
//! stop flag, an overflow scheduling list and (lazily) a timer thread.
//! Worker threads are supplied by the caller: each thread that invokes one
//! of the `process_*` methods becomes an I/O worker for the duration of the
//! call. Any number of workers may run the loop concurrently.
//!
//! # Event loop cycle
//!
//! 1. Enter: atomically check the stop bit and bump the active-thread
//!    count; refuse entry if stop was observed.
//! 2. Drain the overflow list by re-posting refused resumptions.
//! 3. Poll one reactor message (blocking or not, per caller choice).
//! 4. Dispatch: a callback message resolves its pending operation and runs
//!    the completion; a resume message wakes the carried continuation; a
//!    wakeup breaks the loop if stop was requested and is otherwise
//!    swallowed.
//! 5. Exit: decrement the active-thread count.
//!
//! # Stop protocol
//!
//! [`stop`](IoService::stop) sets the stop bit and posts one wakeup per
//! active worker. Each exiting worker posts one further wakeup, so a
//! coalesced notification still cascades to every sibling. In-flight
//! operations still complete after stop; new waits return immediately
//! until [`reset`](IoService::reset).

mod slab;

use crate::error::{Error, Result};
use crate::op::{IoFuture, OpComplete, Operation};
use crate::reactor::{Message, PollMode, ReactorBackend, Source, Token};
use crate::timers::{TimedScheduleOp, TimerShared};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use slab::OpSlab;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bit 0 of the thread-state word.
const STOP_REQUESTED: u32 = 1;
/// Bits 1..32 count active worker threads.
const ACTIVE_INCREMENT: u32 = 2;

/// Default bounded capacity of the reactor's posted-message queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Default)]
struct StatCounters {
    polls: AtomicU64,
    callbacks: AtomicU64,
    resumes: AtomicU64,
    wakeups: AtomicU64,
    unknown_tokens: AtomicU64,
    overflowed: AtomicU64,
    overflow_requeued: AtomicU64,
}

/// Diagnostic counters for an [`IoService`].
#[derive(Debug, Clone, Default)]
pub struct IoStats {
    /// Number of reactor polls issued by the event loop.
    pub polls: u64,
    /// Completion callbacks dispatched.
    pub callbacks: u64,
    /// Resume messages dispatched.
    pub resumes: u64,
    /// Wakeup messages consumed.
    pub wakeups: u64,
    /// Callback messages whose token no longer resolved to an operation.
    pub unknown_tokens: u64,
    /// Resumptions deferred to the overflow list.
    pub overflowed: u64,
    /// Overflowed resumptions successfully re-posted.
    pub overflow_requeued: u64,
}

/// State shared between the service handle, pending operations, the timer
/// thread and worker threads.
pub(crate) struct Shared {
    backend: Arc<dyn ReactorBackend>,
    /// Bit 0: stop requested. Bits 1..32: active worker count.
    thread_state: AtomicU32,
    work_count: AtomicU32,
    /// Resumptions the reactor queue refused; drained by the next worker.
    overflow: SegQueue<Waker>,
    pending: Mutex<OpSlab<Arc<dyn OpComplete>>>,
    timer: OnceLock<Arc<TimerShared>>,
    timer_join: Mutex<Option<JoinHandle<()>>>,
    stats: StatCounters,
}

impl Shared {
    pub(crate) fn backend(&self) -> &dyn ReactorBackend {
        &*self.backend
    }

    pub(crate) fn reserve_op(&self, entry: Arc<dyn OpComplete>) -> Token {
        self.pending.lock().insert(entry)
    }

    pub(crate) fn remove_op(&self, token: Token) -> Option<Arc<dyn OpComplete>> {
        self.pending.lock().remove(token)
    }

    /// Enqueues a continuation for resumption on an I/O worker, deferring
    /// to the overflow list if the reactor queue refuses.
    pub(crate) fn schedule_waker(&self, waker: Waker) {
        match self.backend.post(Message::Resume(waker)) {
            Ok(()) => {}
            Err(Message::Resume(waker)) => {
                self.overflow.push(waker);
                self.stats.overflowed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("reactor queue full, resumption deferred to overflow list");
            }
            Err(_) => unreachable!("posted a resume message"),
        }
    }

    fn try_reschedule_overflow(&self) {
        while let Some(waker) = self.overflow.pop() {
            match self.backend.post(Message::Resume(waker)) {
                Ok(()) => {
                    self.stats.overflow_requeued.fetch_add(1, Ordering::Relaxed);
                }
                Err(Message::Resume(waker)) => {
                    // Still full; put it back and let a later cycle retry.
                    self.overflow.push(waker);
                    return;
                }
                Err(_) => unreachable!("posted a resume message"),
            }
        }
    }

    fn is_stop_requested(&self) -> bool {
        self.thread_state.load(Ordering::Acquire) & STOP_REQUESTED != 0
    }

    fn try_enter_event_loop(&self) -> bool {
        let mut current = self.thread_state.load(Ordering::Relaxed);
        loop {
            if current & STOP_REQUESTED != 0 {
                return false;
            }
            match self.thread_state.compare_exchange_weak(
                current,
                current + ACTIVE_INCREMENT,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn exit_event_loop(&self) {
        self.thread_state
            .fetch_sub(ACTIVE_INCREMENT, Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        let old = self
            .thread_state
            .fetch_or(STOP_REQUESTED, Ordering::Release);
        if old & STOP_REQUESTED == 0 {
            let active = old / ACTIVE_INCREMENT;
            tracing::debug!(active, "stop requested, waking workers");
            for _ in 0..active {
                self.backend.wake();
            }
        }
    }

    /// Runs one event-loop cycle. `Ok(true)` means one event was
    /// processed; `Ok(false)` means the loop should not continue (stop
    /// requested, queue drained, or the wait was interrupted).
    fn try_process_one_event(&self, mode: PollMode) -> Result<bool> {
        if self.is_stop_requested() {
            return Ok(false);
        }
        loop {
            self.try_reschedule_overflow();
            self.stats.polls.fetch_add(1, Ordering::Relaxed);
            let message = match self.backend.poll(mode) {
                Ok(message) => message,
                Err(err) => {
                    // Unrecoverable backend state: terminate the loop for
                    // every worker, not just this one.
                    self.stop();
                    return Err(Error::resource(err).with_context("reactor poll failed"));
                }
            };
            let Some(message) = message else {
                return Ok(false);
            };
            match message {
                Message::Callback(token) => {
                    // Remove-before-dispatch makes completion at-most-once
                    // even when a kernel event races a synthetic one.
                    if let Some(entry) = self.remove_op(token) {
                        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
                        entry.complete();
                        return Ok(true);
                    }
                    self.stats.unknown_tokens.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(token = token.0, "stale completion token");
                }
                Message::Resume(waker) => {
                    self.stats.resumes.fetch_add(1, Ordering::Relaxed);
                    waker.wake();
                    return Ok(true);
                }
                Message::Wakeup => {
                    self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
                    if self.is_stop_requested() {
                        // Cascade in case the backend coalesced wakeups.
                        self.backend.wake();
                        return Ok(false);
                    }
                }
            }
        }
    }

    pub(crate) fn ensure_timer(this: &Arc<Self>) -> Arc<TimerShared> {
        if let Some(timer) = this.timer.get() {
            return timer.clone();
        }
        let (timer, join) = TimerShared::spawn(Arc::downgrade(this));
        match this.timer.set(timer.clone()) {
            Ok(()) => {
                *this.timer_join.lock() = Some(join);
                timer
            }
            Err(_) => {
                // Another thread installed its timer first; retire ours.
                timer.request_shutdown();
                let _ = join.join();
                this.timer.get().expect("timer installed by winner").clone()
            }
        }
    }
}

/// Decrements the active-thread count on every exit path.
struct LoopGuard<'a>(&'a Shared);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.exit_event_loop();
    }
}

/// A single-process asynchronous I/O service.
///
/// Owns the platform reactor, the pending-operation table, the scheduling
/// overflow list and the timer subsystem. See the module docs for the
/// event-loop and stop protocols.
///
/// # Example
///
/// ```no_run
/// use ioloom::IoService;
///
/// let service = IoService::new()?;
/// let scope = service.work_scope();
///
/// std::thread::scope(|s| {
///     for _ in 0..2 {
///         s.spawn(|| service.process_events());
///     }
///     // ... submit operations, then release the work scope ...
///     drop(scope);
/// });
/// # Ok::<(), ioloom::Error>(())
/// ```
pub struct IoService {
    shared: Arc<Shared>,
}

impl IoService {
    /// Creates a service over the platform's default backend.
    ///
    /// # Errors
    ///
    /// Backend construction failures (kernel poller creation) surface here;
    /// nothing is ever suspended against a half-built service.
    pub fn new() -> Result<Self> {
        Self::with_concurrency_hint(0)
    }

    /// Creates a service sized for roughly `hint` concurrent workers.
    ///
    /// `0` selects the defaults. The hint scales the reactor's bounded
    /// message queue; workers beyond the hint still function, they just
    /// reach the overflow path sooner.
    ///
    /// # Errors
    ///
    /// Backend construction failures surface here.
    pub fn with_concurrency_hint(hint: u32) -> Result<Self> {
        let capacity = if hint == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            (hint as usize).saturating_mul(256).max(256)
        };
        #[cfg(unix)]
        let backend = crate::reactor::ReadinessReactor::with_queue_capacity(capacity)
            .map_err(|e| Error::resource(e).with_context("creating reactor"))?;
        #[cfg(windows)]
        let backend = {
            let _ = capacity;
            crate::reactor::IocpReactor::new()
                .map_err(|e| Error::resource(e).with_context("creating reactor"))?
        };
        Ok(Self::with_backend(Arc::new(backend)))
    }

    /// Creates a service over a caller-supplied backend.
    ///
    /// This is how tests drive the core against the deterministic
    /// [`LabReactor`](crate::reactor::LabReactor).
    #[must_use]
    pub fn with_backend(backend: Arc<dyn ReactorBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                thread_state: AtomicU32::new(0),
                work_count: AtomicU32::new(0),
                overflow: SegQueue::new(),
                pending: Mutex::new(OpSlab::new()),
                timer: OnceLock::new(),
                timer_join: Mutex::new(None),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Processes events until the service is stopped.
    ///
    /// Returns the number of events processed by this call.
    ///
    /// # Errors
    ///
    /// Propagates an unrecoverable reactor failure after setting the stop
    /// flag. Individual operation failures are carried in their results
    /// and never surface here.
    pub fn process_events(&self) -> Result<u64> {
        self.run_loop(PollMode::Block, u64::MAX)
    }

    /// Processes events until the queue is drained or the service stopped.
    ///
    /// # Errors
    ///
    /// As [`process_events`](Self::process_events).
    pub fn process_pending_events(&self) -> Result<u64> {
        self.run_loop(PollMode::NonBlock, u64::MAX)
    }

    /// Blocks until one event is processed or the service is stopped.
    ///
    /// # Errors
    ///
    /// As [`process_events`](Self::process_events).
    pub fn process_one_event(&self) -> Result<u64> {
        self.run_loop(PollMode::Block, 1)
    }

    /// Processes one pending event, if any, without blocking.
    ///
    /// # Errors
    ///
    /// As [`process_events`](Self::process_events).
    pub fn process_one_pending_event(&self) -> Result<u64> {
        self.run_loop(PollMode::NonBlock, 1)
    }

    fn run_loop(&self, mode: PollMode, limit: u64) -> Result<u64> {
        let mut count = 0;
        if self.shared.try_enter_event_loop() {
            let _guard = LoopGuard(&self.shared);
            while count < limit && self.shared.try_process_one_event(mode)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Requests that all workers leave the event loop.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Clears the stop flag so workers can re-enter the event loop.
    ///
    /// Callers must ensure every worker has returned from the `process_*`
    /// methods before resetting.
    pub fn reset(&self) {
        let old = self
            .shared
            .thread_state
            .fetch_and(!STOP_REQUESTED, Ordering::Relaxed);
        debug_assert_eq!(
            old & !STOP_REQUESTED,
            0,
            "reset while workers are still inside the event loop"
        );
    }

    /// Returns true if [`stop`](Self::stop) has been requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.shared.is_stop_requested()
    }

    /// Notes one more unit of logically-live work.
    pub fn notify_work_started(&self) {
        self.shared.work_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Notes one unit of work finished; the last one stops the service.
    pub fn notify_work_finished(&self) {
        if self.shared.work_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }

    /// Returns an RAII guard around a unit of work.
    #[must_use]
    pub fn work_scope(&self) -> WorkScope {
        self.notify_work_started();
        WorkScope {
            shared: self.shared.clone(),
        }
    }

    /// Returns an awaitable that resumes the caller on an I/O worker.
    #[must_use]
    pub fn schedule(&self) -> ScheduleOp {
        ScheduleOp {
            shared: self.shared.clone(),
            posted: false,
        }
    }

    /// Returns an awaitable that resumes the caller on an I/O worker at or
    /// after `deadline`.
    ///
    /// If `token` fires before the deadline, the await resolves to
    /// [`Error::cancelled`] as soon as the timer thread processes the
    /// request.
    #[must_use]
    pub fn schedule_at(&self, deadline: Instant, token: crate::CancelToken) -> TimedScheduleOp {
        TimedScheduleOp::new(self.shared.clone(), deadline, token)
    }

    /// Returns an awaitable that resumes the caller after `delay`.
    #[must_use]
    pub fn schedule_after(&self, delay: Duration, token: crate::CancelToken) -> TimedScheduleOp {
        self.schedule_at(Instant::now() + delay, token)
    }

    /// Submits a non-cancellable operation.
    pub fn submit<O: Operation>(&self, op: O) -> IoFuture<O> {
        IoFuture::new(self.shared.clone(), op, crate::CancelToken::none())
    }

    /// Submits an operation observing `token`.
    pub fn submit_cancellable<O: Operation>(
        &self,
        op: O,
        token: crate::CancelToken,
    ) -> IoFuture<O> {
        IoFuture::new(self.shared.clone(), op, token)
    }

    /// Registers a handle with the service's reactor.
    ///
    /// Must precede any asynchronous operation on the handle.
    ///
    /// # Errors
    ///
    /// Surfaces kernel rejection as a resource error.
    pub fn register_handle(&self, source: &impl Source) -> Result<()> {
        self.shared
            .backend
            .register(source.raw_os_handle())
            .map_err(|e| Error::resource(e).with_context("registering handle"))
    }

    /// Unregisters a handle; idempotent, disarms if still armed.
    ///
    /// # Errors
    ///
    /// Surfaces kernel failure as a resource error.
    pub fn unregister_handle(&self, source: &impl Source) -> Result<()> {
        self.shared
            .backend
            .unregister(source.raw_os_handle())
            .map_err(|e| Error::resource(e).with_context("unregistering handle"))
    }

    /// Returns the number of operations currently pending in the reactor.
    #[must_use]
    pub fn pending_op_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Returns a snapshot of the service's diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> IoStats {
        let counters = &self.shared.stats;
        IoStats {
            polls: counters.polls.load(Ordering::Relaxed),
            callbacks: counters.callbacks.load(Ordering::Relaxed),
            resumes: counters.resumes.load(Ordering::Relaxed),
            wakeups: counters.wakeups.load(Ordering::Relaxed),
            unknown_tokens: counters.unknown_tokens.load(Ordering::Relaxed),
            overflowed: counters.overflowed.load(Ordering::Relaxed),
            overflow_requeued: counters.overflow_requeued.load(Ordering::Relaxed),
        }
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.timer.get() {
            timer.request_shutdown();
        }
        if let Some(join) = self.shared.timer_join.lock().take() {
            let _ = join.join();
        }
    }
}

impl std::fmt::Debug for IoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoService")
            .field("stop_requested", &self.is_stop_requested())
            .field("pending_ops", &self.pending_op_count())
            .finish_non_exhaustive()
    }
}

/// RAII guard for a unit of work tracked by the service.
///
/// Cloning notes another unit; dropping the last clone of the last unit
/// stops the service.
pub struct WorkScope {
    shared: Arc<Shared>,
}

impl Clone for WorkScope {
    fn clone(&self) -> Self {
        self.shared.work_count.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for WorkScope {
    fn drop(&mut self) {
        if self.shared.work_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.stop();
        }
    }
}

/// Awaitable resumption on an I/O worker thread.
///
/// Created by [`IoService::schedule`]. The first poll enqueues the
/// continuation through the reactor (or the overflow list) and suspends;
/// the wake arrives from whichever worker dequeues it.
#[must_use = "futures do nothing unless awaited"]
pub struct ScheduleOp {
    shared: Arc<Shared>,
    posted: bool,
}

impl Future for ScheduleOp {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.posted {
            Poll::Ready(())
        } else {
            this.shared.schedule_waker(cx.waker().clone());
            this.posted = true;
            Poll::Pending
        }
    }
}
