//! Readiness-notification backend (epoll / kqueue).
//!
//! This backend wraps [`polling::Poller`], which selects epoll on Linux and
//! kqueue on macOS/BSD. It is a *readiness* model: the kernel reports that
//! a handle is ready and the completion dispatch performs the actual
//! syscall. Arming is therefore per-operation and oneshot.
//!
//! User-posted messages do not travel through the kernel. They sit in two
//! in-process queues multiplexed with kernel readiness behind the same
//! [`poll`](ReadinessReactor::poll) call, so each worker has a single wait
//! point:
//!
//! - a **bounded** posted queue for [`Message::Resume`]/[`Message::Wakeup`]
//!   whose refusal drives the service's overflow path, and
//! - an **unbounded** injection queue for synthetic completions, which must
//!   never be lost (cancellation resumes and always-ready handles travel
//!   here).
//!
//! A `notify()` on the poller pairs with every enqueue so blocked workers
//! observe the message; a blocking wait that comes back without events is
//! by construction the notify path and surfaces as [`Message::Wakeup`].
//!
//! Regular files refuse epoll registration with `EPERM` because they are
//! always ready; [`arm`](ReadinessReactor::arm) synthesises an immediate
//! callback message for them instead of failing.
#![allow(unsafe_code)]

use super::{Interest, Message, OsHandle, PollMode, ReactorBackend, Token};
use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;
use polling::{Event as PollEvent, Events as PollEvents, Poller};
use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// Default capacity of the bounded posted-message queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Readiness backend over epoll/kqueue.
pub struct ReadinessReactor {
    poller: Poller,
    /// Bounded queue of user-posted messages; refusal is the overflow signal.
    posted: ArrayQueue<Message>,
    /// Unbounded synthetic-completion injections.
    injected: SegQueue<Message>,
    /// Registered handles (bookkeeping; arming is per-operation).
    registered: Mutex<HashSet<OsHandle>>,
    /// Currently armed handles and the operation token each carries.
    armed: Mutex<HashMap<OsHandle, Token>>,
    /// Kernel wait slot: one thread sleeps in the kernel at a time, the
    /// rest queue on this lock and drain the in-process queues first.
    wait_slot: Mutex<PollEvents>,
}

impl ReadinessReactor {
    /// Creates a new readiness reactor with the default queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel poller cannot be created.
    pub fn new() -> io::Result<Self> {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a new readiness reactor with a bounded posted-queue capacity.
    ///
    /// A small capacity forces the service's overflow path early, which the
    /// tests use; production callers want the default.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel poller cannot be created.
    pub fn with_queue_capacity(capacity: usize) -> io::Result<Self> {
        let poller = Poller::new()?;
        let events = PollEvents::with_capacity(NonZeroUsize::new(1).expect("nonzero"));
        Ok(Self {
            poller,
            posted: ArrayQueue::new(capacity.max(1)),
            injected: SegQueue::new(),
            registered: Mutex::new(HashSet::new()),
            armed: Mutex::new(HashMap::new()),
            wait_slot: Mutex::new(events),
        })
    }

    fn event_for(token: Token, interest: Interest) -> PollEvent {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(token.0),
            (true, false) => PollEvent::readable(token.0),
            (false, true) => PollEvent::writable(token.0),
            (false, false) => PollEvent::none(token.0),
        }
    }
}

impl ReactorBackend for ReadinessReactor {
    fn register(&self, handle: OsHandle) -> io::Result<()> {
        self.registered.lock().insert(handle);
        Ok(())
    }

    fn unregister(&self, handle: OsHandle) -> io::Result<()> {
        // Disarm first so close paths can unregister unconditionally.
        self.disarm(handle)?;
        self.registered.lock().remove(&handle);
        Ok(())
    }

    fn arm(&self, handle: OsHandle, token: Token, interest: Interest) -> io::Result<()> {
        let event = Self::event_for(token, interest);
        let mut armed = self.armed.lock();
        match armed.get(&handle) {
            Some(&existing) if existing != token => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "handle armed for another operation",
            )),
            Some(_) => {
                // SAFETY: the handle stays open while armed; the op state
                // machine disarms before the owning resource closes it.
                let fd = unsafe { BorrowedFd::borrow_raw(handle) };
                self.poller.modify(fd, event)
            }
            None => {
                // SAFETY: as above; the fd is valid for the duration of the
                // registration.
                match unsafe { self.poller.add(handle, event) } {
                    Ok(()) => {
                        armed.insert(handle, token);
                        tracing::trace!(handle, token = token.0, "armed");
                        Ok(())
                    }
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        // Always-ready handle (regular file): epoll refuses
                        // it, so deliver the completion immediately.
                        drop(armed);
                        tracing::trace!(handle, token = token.0, "always-ready, injecting");
                        self.post_callback(token);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn disarm(&self, handle: OsHandle) -> io::Result<()> {
        let removed = self.armed.lock().remove(&handle);
        if removed.is_none() {
            return Ok(());
        }
        // SAFETY: the handle was armed and is still open; disarm runs
        // before the owning resource closes it.
        let fd = unsafe { BorrowedFd::borrow_raw(handle) };
        match self.poller.delete(fd) {
            Ok(()) => Ok(()),
            // Already gone from the kernel set, or an always-ready handle
            // that was never truly added.
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::PermissionDenied =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn post(&self, message: Message) -> Result<(), Message> {
        self.posted.push(message)?;
        let _ = self.poller.notify();
        Ok(())
    }

    fn post_callback(&self, token: Token) {
        self.injected.push(Message::Callback(token));
        let _ = self.poller.notify();
    }

    fn poll(&self, mode: PollMode) -> io::Result<Option<Message>> {
        if let Some(message) = self.injected.pop() {
            return Ok(Some(message));
        }
        if let Some(message) = self.posted.pop() {
            return Ok(Some(message));
        }

        let mut events = match mode {
            PollMode::Block => self.wait_slot.lock(),
            PollMode::NonBlock => match self.wait_slot.try_lock() {
                Some(guard) => guard,
                // Another worker holds the kernel slot; the queues above
                // were empty, so there is nothing pending for us.
                None => return Ok(None),
            },
        };
        events.clear();
        let timeout = match mode {
            PollMode::Block => None,
            PollMode::NonBlock => Some(Duration::ZERO),
        };
        match self.poller.wait(&mut events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }

        let mut first = None;
        for event in events.iter() {
            let message = Message::Callback(Token(event.key));
            if first.is_none() {
                first = Some(message);
            } else {
                self.injected.push(message);
            }
        }
        drop(events);

        if let Some(message) = first {
            return Ok(Some(message));
        }

        // Empty wait: the notify that woke us raced with an enqueue.
        if let Some(message) = self.injected.pop() {
            return Ok(Some(message));
        }
        if let Some(message) = self.posted.pop() {
            return Ok(Some(message));
        }
        Ok(match mode {
            PollMode::Block => Some(Message::Wakeup),
            PollMode::NonBlock => None,
        })
    }

    fn wake(&self) {
        // Refusal means the queue is full of real messages; a blocked
        // worker will find those instead.
        let _ = self.posted.push(Message::Wakeup);
        let _ = self.poller.notify();
    }

    fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }
}

impl std::fmt::Debug for ReadinessReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessReactor")
            .field("registered", &self.registered.lock().len())
            .field("armed", &self.armed.lock().len())
            .finish_non_exhaustive()
    }
}
