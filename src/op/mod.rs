//! Asynchronous operation state machine.
//!
//! Every concrete I/O operation — a recv, a file read, a timed resumption —
//! supplies a small capability record ([`Operation`]): arm the kernel call,
//! optionally cancel it, perform the syscall when the handle signals ready,
//! and translate the stored outcome. The state machine here owns everything
//! else: suspension, synchronisation, cancellation plumbing and one-shot
//! resumption.
//!
//! # The three-way race
//!
//! Three actors touch an operation concurrently: the *starter* (the first
//! `poll`), the *cancellation callback* (any thread the token fires on),
//! and the *completer* (the event-loop thread dispatching the reactor
//! message). They coordinate through one atomic phase word:
//!
//! ```text
//!                  ┌─────────────┐
//!        ┌─────────│ NotStarted  │──────────┐
//!        │ starter └─────────────┘ cancel   │
//!        ▼                callback ▼        │
//! ┌─────────────┐        ┌──────────────────────┐
//! │   Started   │◀───────│ CancellationRequested │
//! └──────┬──────┘ starter└──────────┬───────────┘
//!        │ completer                │ completer
//!        ▼                          ▼
//! ┌─────────────────────────────────────────┐
//! │                Completed                 │   (terminal, entered once)
//! └─────────────────────────────────────────┘
//! ```
//!
//! - The completer swaps in `Completed` unconditionally; it wakes the
//!   continuation only if the swap observed `Started`, because any other
//!   value means the starter is still inside its first poll and will
//!   observe `Completed` itself.
//! - A cancellation callback that observes `NotStarted` transfers the
//!   responsibility to cancel to the starter by advancing to
//!   `CancellationRequested`.
//! - Phase transitions release on publish and acquire on observation; the
//!   fields written before publication (waker, completion entry) are
//!   synchronised by the phase edges.
//!
//! An operation enters `Completed` at most once and is observed there by
//! exactly one resumer, so the continuation is woken at most once per
//! lifetime.

use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{Error, Result};
use crate::reactor::{Interest, OsHandle, Token};
use crate::service::Shared;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLATION_REQUESTED: u8 = 2;
const COMPLETED: u8 = 3;

/// Sentinel for an op that has not armed a handle.
const HANDLE_UNSET: isize = isize::MIN;
/// Sentinel for an op with no completion slot reserved.
const TOKEN_UNSET: usize = usize::MAX;

/// Outcome of [`Operation::try_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation finished synchronously; the result is already stored
    /// and [`Operation::take_result`] may run on the current thread.
    Complete,
    /// The operation is pending: arm `handle` for `interest` and suspend.
    Pending {
        /// The kernel handle to arm.
        handle: OsHandle,
        /// The readiness interest to arm for.
        interest: Interest,
    },
}

/// Capability record supplied by a concrete I/O operation.
///
/// The state machine is generic over this record; the concrete operation
/// never sees the phase word, the continuation or the reactor.
///
/// `perform` and `cancel` may run on different threads than `try_start`,
/// but never concurrently with each other or with `take_result`: the state
/// machine serialises access to the record.
pub trait Operation: Send + 'static {
    /// The concrete result type.
    type Output: Send + 'static;

    /// Arms the kernel call.
    ///
    /// On a readiness backend this typically attempts the syscall
    /// optimistically or just reports which handle to watch; on a
    /// completion backend it issues the overlapped call.
    ///
    /// # Errors
    ///
    /// A construction-level failure (bad handle, kernel refusal) surfaces
    /// at the call site; the caller is never suspended.
    fn try_start(&mut self) -> io::Result<Progress>;

    /// Performs the I/O once the handle signals ready and stores the
    /// outcome. Runs on the event-loop thread.
    fn perform(&mut self);

    /// Requests kernel-level cancellation of the armed call.
    ///
    /// The default does nothing, which is correct for readiness backends
    /// where withdrawing the notification is the whole cancellation.
    fn cancel(&mut self) {}

    /// Translates the stored outcome into the concrete result.
    fn take_result(&mut self) -> Result<Self::Output>;
}

/// Completion dispatch interface stored in the service's pending-op slab.
///
/// Set once when the operation arms; invoked at most once, by the event
/// loop that removed the slab entry.
pub(crate) trait OpComplete: Send + Sync {
    fn complete(&self);
}

/// Heap-shared per-operation state.
///
/// The suspended caller, the pending-op slab and the cancellation callback
/// each hold an `Arc` of this; the phase word arbitrates between them.
pub(crate) struct OpShared<O: Operation> {
    service: Arc<Shared>,
    phase: AtomicU8,
    /// Set by whichever actor cancelled the operation; read on resume.
    cancelled: AtomicBool,
    waker: Mutex<Option<Waker>>,
    op: Mutex<O>,
    handle: AtomicIsize,
    token: AtomicUsize,
}

impl<O: Operation> OpShared<O> {
    fn new(service: Arc<Shared>, op: O) -> Arc<Self> {
        Arc::new(Self {
            service,
            phase: AtomicU8::new(NOT_STARTED),
            cancelled: AtomicBool::new(false),
            waker: Mutex::new(None),
            op: Mutex::new(op),
            handle: AtomicIsize::new(HANDLE_UNSET),
            token: AtomicUsize::new(TOKEN_UNSET),
        })
    }

    fn set_waker(&self, waker: Waker) {
        *self.waker.lock() = Some(waker);
    }

    fn armed_handle(&self) -> Option<OsHandle> {
        let raw = self.handle.load(Ordering::Acquire);
        (raw != HANDLE_UNSET).then(|| raw as OsHandle)
    }

    fn slab_token(&self) -> Option<Token> {
        let raw = self.token.load(Ordering::Acquire);
        (raw != TOKEN_UNSET).then_some(Token(raw))
    }

    /// Cancellation callback entry point (any thread).
    fn cancel_from_token(&self) {
        let mut phase = self.phase.load(Ordering::Acquire);
        if phase == NOT_STARTED {
            match self.phase.compare_exchange(
                NOT_STARTED,
                CANCELLATION_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // The starter is mid-suspend; it now owns the cancellation.
                Ok(_) => return,
                Err(actual) => phase = actual,
            }
        }
        if phase != COMPLETED {
            self.request_cancel_pending();
        }
    }

    /// Cancels an operation that is (or is about to be) pending in the
    /// reactor: kernel-cancel hook, mark cancelled, withdraw the
    /// notification, and inject a synthetic completion so the event loop
    /// still resumes the suspended caller.
    fn request_cancel_pending(&self) {
        tracing::trace!("cancelling pending operation");
        self.op.lock().cancel();
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.armed_handle() {
            let _ = self.service.backend().disarm(handle);
        }
        if let Some(token) = self.slab_token() {
            self.service.backend().post_callback(token);
        }
    }
}

impl<O: Operation> OpComplete for OpShared<O> {
    /// Completion dispatch (event-loop thread).
    fn complete(&self) {
        if !self.cancelled.load(Ordering::Acquire) {
            self.op.lock().perform();
        }
        if let Some(handle) = self.armed_handle() {
            let _ = self.service.backend().disarm(handle);
        }
        let previous = self.phase.swap(COMPLETED, Ordering::AcqRel);
        if previous == STARTED {
            // The caller is suspended; resume it. Any other value means
            // the first poll is still in progress and will observe
            // `Completed` itself.
            if let Some(waker) = self.waker.lock().take() {
                waker.wake();
            }
        }
    }
}

enum Stage {
    NotStarted,
    Pending,
    Done,
}

/// An awaitable I/O operation bound to an [`IoService`](crate::IoService).
///
/// Created by [`IoService::submit`](crate::IoService::submit) and
/// [`IoService::submit_cancellable`](crate::IoService::submit_cancellable).
/// Resolves to the concrete result, or [`Error::cancelled`] if cancellation
/// won the race against completion.
///
/// Dropping a pending future withdraws the operation: the completion slot
/// is released and the handle disarmed.
#[must_use = "futures do nothing unless awaited"]
pub struct IoFuture<O: Operation> {
    shared: Arc<OpShared<O>>,
    token: CancelToken,
    registration: Option<CancelRegistration>,
    stage: Stage,
}

impl<O: Operation> IoFuture<O> {
    pub(crate) fn new(service: Arc<Shared>, op: O, token: CancelToken) -> Self {
        Self {
            shared: OpShared::new(service, op),
            token,
            registration: None,
            stage: Stage::NotStarted,
        }
    }

    /// Finishes the operation: read the cancelled verdict, release the
    /// cancellation registration, then surface the result — in that order,
    /// so a user-supplied registration destructor cannot observe the
    /// extraction half-done.
    fn finish(&mut self) -> Poll<Result<O::Output>> {
        let cancelled = self.shared.cancelled.load(Ordering::Acquire);
        self.registration = None;
        self.stage = Stage::Done;
        if cancelled {
            Poll::Ready(Err(Error::cancelled()))
        } else {
            Poll::Ready(self.shared.op.lock().take_result())
        }
    }

    fn fail(&mut self, err: Error) -> Poll<Result<O::Output>> {
        self.registration = None;
        self.stage = Stage::Done;
        Poll::Ready(Err(err))
    }

    fn first_poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<O::Output>> {
        // Cancel-before-start short-circuits without touching the kernel.
        if self.token.is_cancellation_requested() {
            self.stage = Stage::Done;
            return Poll::Ready(Err(Error::cancelled()));
        }

        self.shared.set_waker(cx.waker().clone());

        let cancellable = self.token.can_be_cancelled();
        if !cancellable {
            // Non-cancellable fast path: no callback can race the start.
            self.shared.phase.store(STARTED, Ordering::Release);
        }

        // Reserve the completion slot and register the cancellation
        // callback before arming anything: every allocation this operation
        // will ever need happens before the kernel call, so a failure here
        // cannot leak an armed-but-unobserved operation.
        let entry: Arc<dyn OpComplete> = self.shared.clone();
        let token = self.shared.service.reserve_op(entry);
        self.shared.token.store(token.0, Ordering::Release);

        if cancellable {
            let state = self.shared.clone();
            self.registration = Some(self.token.register(move || state.cancel_from_token()));
        }

        let started = self.shared.op.lock().try_start();
        match started {
            Err(err) => {
                self.shared.service.remove_op(token);
                self.fail(err.into())
            }
            Ok(Progress::Complete) => {
                self.shared.service.remove_op(token);
                self.finish()
            }
            Ok(Progress::Pending { handle, interest }) => {
                self.shared.handle.store(handle as isize, Ordering::Release);
                if let Err(err) = self.shared.service.backend().arm(handle, token, interest) {
                    self.shared.service.remove_op(token);
                    return self.fail(Error::resource(err).with_context("arming operation"));
                }
                if !cancellable {
                    self.stage = Stage::Pending;
                    return Poll::Pending;
                }
                match self.shared.phase.compare_exchange(
                    NOT_STARTED,
                    STARTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.stage = Stage::Pending;
                        Poll::Pending
                    }
                    Err(CANCELLATION_REQUESTED) => {
                        // The cancellation callback arrived during
                        // try_start and handed the cancel to us.
                        self.shared.request_cancel_pending();
                        match self.shared.phase.compare_exchange(
                            CANCELLATION_REQUESTED,
                            STARTED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                self.stage = Stage::Pending;
                                Poll::Pending
                            }
                            // The completer already finished; do not suspend.
                            Err(_) => self.finish(),
                        }
                    }
                    // The completer won the race outright.
                    Err(_) => self.finish(),
                }
            }
        }
    }
}

impl<O: Operation> Future for IoFuture<O> {
    type Output = Result<O::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.stage {
            Stage::NotStarted => this.first_poll(cx),
            Stage::Pending => {
                if this.shared.phase.load(Ordering::Acquire) == COMPLETED {
                    return this.finish();
                }
                this.shared.set_waker(cx.waker().clone());
                // Re-check after publishing the fresh waker: the completer
                // may have swapped phases in between and taken the old one.
                if this.shared.phase.load(Ordering::Acquire) == COMPLETED {
                    return this.finish();
                }
                Poll::Pending
            }
            Stage::Done => panic!("IoFuture polled after completion"),
        }
    }
}

impl<O: Operation> Unpin for IoFuture<O> {}

impl<O: Operation> Drop for IoFuture<O> {
    fn drop(&mut self) {
        if matches!(self.stage, Stage::Pending) {
            // Withdraw a mid-flight operation: release the completion slot
            // so the token cannot dispatch, then disarm. The registration
            // field drops afterwards and detaches the callback.
            if let Some(token) = self.shared.slab_token() {
                let _ = self.shared.service.remove_op(token);
            }
            if let Some(handle) = self.shared.armed_handle() {
                let _ = self.shared.service.backend().disarm(handle);
            }
        }
    }
}
