//! Reactor abstraction for I/O event multiplexing.
//!
//! This module provides the [`ReactorBackend`] trait and associated types
//! for platform-agnostic I/O event notification. The reactor is the leaf of
//! the runtime core: it multiplexes handle readiness/completion with
//! user-posted messages behind a single per-worker wait point.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         IoService                               │
//! │  ┌───────────────┐    ┌───────────────┐    ┌────────────────┐  │
//! │  │  event loop   │────│  pending-op   │────│ overflow list  │  │
//! │  │ (per worker)  │    │     slab      │    │  (lock-free)   │  │
//! │  └───────┬───────┘    └───────────────┘    └────────────────┘  │
//! │          │ poll() → Message                                     │
//! │  ┌───────▼────────────────────────────────────────────────────┐ │
//! │  │                     ReactorBackend                          │ │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │ │
//! │  │  │ posted queue │  │  injection   │  │   Platform API   │  │ │
//! │  │  │  (bounded)   │  │ (unbounded)  │  │ (epoll/kqueue/   │  │ │
//! │  │  │              │  │              │  │  compl. port)    │  │ │
//! │  │  └──────────────┘  └──────────────┘  └──────────────────┘  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Messages
//!
//! | Message | Produced by | Consumed as |
//! |---------|-------------|-------------|
//! | [`Message::Callback`] | kernel readiness/completion, cancellation, always-ready handles | completion dispatch on the op state resolved through the token |
//! | [`Message::Resume`] | [`post`](ReactorBackend::post) (schedule requests) | one-shot wake of the carried continuation |
//! | [`Message::Wakeup`] | [`wake`](ReactorBackend::wake) (stop protocol, overflow retry) | unblocks a worker; carries no work |
//!
//! # Backends
//!
//! | Platform | Model | Module |
//! |----------|-------|--------|
//! | Linux / macOS / BSD | readiness (epoll/kqueue via `polling`) | `readiness.rs` |
//! | Windows | completion port | `iocp.rs` |
//! | Testing | deterministic in-memory | `lab.rs` |
//!
//! On a completion-port backend, [`arm`](ReactorBackend::arm) is a no-op:
//! the syscall that starts the operation already carries the completion
//! cookie. On a readiness backend, arming is per-operation and the actual
//! syscall runs when the completion dispatch observes readiness.
//!
//! # Failure semantics
//!
//! Backend construction errors are fatal and bubble out of service
//! construction. At runtime a refused [`post`](ReactorBackend::post)
//! degrades to the service's overflow list; it never terminates the
//! service.

pub mod interest;
pub mod lab;

#[cfg(unix)]
pub mod readiness;

pub mod iocp;

pub use interest::Interest;
pub use lab::LabReactor;

#[cfg(unix)]
pub use readiness::ReadinessReactor;

pub use iocp::IocpReactor;

use std::io;
use std::task::Waker;

/// Raw OS handle for an I/O object.
#[cfg(unix)]
pub type OsHandle = std::os::fd::RawFd;

/// Raw OS handle for an I/O object.
#[cfg(windows)]
pub type OsHandle = isize;

/// A kernel I/O object that can be registered with a reactor.
pub trait Source {
    /// Returns the raw OS handle for registration and arming.
    fn raw_os_handle(&self) -> OsHandle;
}

#[cfg(unix)]
impl<T: std::os::fd::AsRawFd> Source for T {
    fn raw_os_handle(&self) -> OsHandle {
        self.as_raw_fd()
    }
}

/// Token identifying an armed operation.
///
/// The token is the cookie supplied at [`arm`](ReactorBackend::arm) time;
/// a [`Message::Callback`] carrying it is resolvable back to the pending
/// operation's state through the service's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Creates a new token.
    #[must_use]
    pub const fn new(val: usize) -> Self {
        Self(val)
    }
}

/// A message produced by the reactor and consumed by the event loop.
#[derive(Debug)]
pub enum Message {
    /// Completion or readiness for an armed handle.
    Callback(Token),
    /// Resume the carried continuation on the dequeuing worker.
    Resume(Waker),
    /// Unblock a worker without carrying work.
    Wakeup,
}

/// Whether a [`poll`](ReactorBackend::poll) call may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Block until a message is available or the wait is interrupted.
    Block,
    /// Return immediately if no message is available.
    NonBlock,
}

/// Platform backend multiplexing handle events and user-posted messages.
///
/// Implementations must be thread-safe: any number of workers may call
/// [`poll`](ReactorBackend::poll) concurrently, and producers post from
/// arbitrary threads. The backend is the sole owner of registration state
/// for a handle between `register` and `unregister`.
pub trait ReactorBackend: Send + Sync {
    /// Registers a handle with the backend.
    ///
    /// On the readiness backend this is bookkeeping only; arming happens
    /// per operation. On a completion-port backend registration associates
    /// the handle with the port for its lifetime.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the association.
    fn register(&self, handle: OsHandle) -> io::Result<()>;

    /// Unregisters a handle.
    ///
    /// Idempotent: unregistering a handle that is not registered is not an
    /// error. A still-armed handle is disarmed first, so close paths can
    /// unconditionally unregister.
    fn unregister(&self, handle: OsHandle) -> io::Result<()>;

    /// Requests notification for the given interest on a handle.
    ///
    /// On a backend where the handle is always ready and refuses arming
    /// (regular files under epoll), an immediate [`Message::Callback`]
    /// carrying `token` is synthesised instead of failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is already armed for a different
    /// operation, or the kernel rejects the request.
    fn arm(&self, handle: OsHandle, token: Token, interest: Interest) -> io::Result<()>;

    /// Cancels notification for a handle.
    ///
    /// Silently tolerates a handle that is not armed.
    ///
    /// # Errors
    ///
    /// Any other kernel failure propagates.
    fn disarm(&self, handle: OsHandle) -> io::Result<()>;

    /// Non-blocking enqueue of a user message.
    ///
    /// # Errors
    ///
    /// Hands the message back if the queue refuses it (memory pressure /
    /// queue full); the caller is responsible for deferring it via the
    /// service's overflow list.
    fn post(&self, message: Message) -> Result<(), Message>;

    /// Injects a synthetic completion for `token`.
    ///
    /// Used by the cancellation path to resume an operation whose kernel
    /// notification was withdrawn. Never refuses: losing the message would
    /// strand the suspended caller.
    fn post_callback(&self, token: Token);

    /// Returns at most one message.
    ///
    /// An interrupted wait returns `Ok(None)` without error. A blocking
    /// wait that returns without events yields [`Message::Wakeup`]: the
    /// only way a blocking wait comes back empty is the notify path.
    ///
    /// # Errors
    ///
    /// Unrepresentable backend states propagate; the event loop treats
    /// them as fatal.
    fn poll(&self, mode: PollMode) -> io::Result<Option<Message>>;

    /// Unblocks one blocked [`poll`](Self::poll).
    ///
    /// Failures are swallowed: if the wakeup cannot be delivered the queue
    /// is full, and the blocked worker will find those messages instead.
    fn wake(&self);

    /// Returns the number of currently registered handles.
    fn registered_count(&self) -> usize;
}
