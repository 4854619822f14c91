//! ioloom: a cross-platform, single-process asynchronous I/O runtime core.
//!
//! # Overview
//!
//! ioloom is the awaitable-operation engine underneath an async I/O stack:
//! a platform-abstracted reactor, an operation state machine that resolves
//! the three-way race between start, cancellation and completion, and an
//! I/O service owning the event loop, wakeup signalling, timers and a
//! fallback scheduling queue. Together they deliver at-most-once
//! completion, deterministic cancellation and one-shot resumption of
//! suspended callers under multi-threaded contention.
//!
//! Concrete I/O resources (files, sockets) are external collaborators:
//! each concrete operation supplies only a small capability record
//! ([`Operation`]) and the core owns scheduling, suspension,
//! synchronisation, cancellation plumbing and resumption.
//!
//! # Core guarantees
//!
//! - **At-most-once completion**: an operation enters its terminal phase
//!   exactly once and exactly one resumer observes it there.
//! - **Deterministic cancellation**: cancellation either wins (the await
//!   fails with [`Error::cancelled`]) or loses (the result is surfaced);
//!   never both, never neither.
//! - **One-shot resumption**: a suspended caller is woken at most once per
//!   suspension, from whichever worker dequeues its message.
//! - **No hidden threads or pools**: callers supply worker threads by
//!   invoking the event loop; the only internal thread is the lazily
//!   started timer thread.
//!
//! # Module structure
//!
//! - [`reactor`]: platform backends (readiness, completion port, lab) and
//!   the message/interest/token vocabulary
//! - [`op`]: the async-operation state machine and the [`Operation`]
//!   capability record
//! - [`service`]: [`IoService`], the event loop, work tracking, scheduling
//! - [`timers`]: the timer thread and deadline-scheduled resumptions
//! - [`cancel`]: cancellation sources, tokens and scoped registrations
//! - [`error`]: the two-kind error surface (cancelled vs resource)
//!
//! # Example
//!
//! ```no_run
//! use ioloom::{CancelSource, IoService};
//! use std::time::Duration;
//!
//! let service = IoService::new()?;
//! let source = CancelSource::new();
//!
//! // A worker thread drives the event loop; the timer resumes on it.
//! std::thread::scope(|s| {
//!     s.spawn(|| service.process_events());
//!
//!     let wait = service.schedule_after(Duration::from_millis(10), source.token());
//!     // ... await `wait` from your executor of choice ...
//!     # drop(wait);
//!
//!     service.stop();
//! });
//! # Ok::<(), ioloom::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

pub mod cancel;
pub mod error;
pub mod op;
pub mod reactor;
pub mod service;
pub mod timers;

pub use cancel::{CancelRegistration, CancelSource, CancelToken};
pub use error::{Error, ErrorKind, Result};
pub use op::{IoFuture, Operation, Progress};
pub use reactor::{Interest, Message, OsHandle, PollMode, ReactorBackend, Source, Token};
pub use service::{IoService, IoStats, ScheduleOp, WorkScope};
pub use timers::TimedScheduleOp;
