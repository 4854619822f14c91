//! Deterministic lab backend for testing.
//!
//! [`LabReactor`] implements [`ReactorBackend`] without touching the OS.
//! Test code injects readiness with [`inject_ready`](LabReactor::inject_ready)
//! and marks handles as always-ready to exercise the synthetic-callback
//! path. Blocking polls park on a condvar instead of the kernel, so event
//! loop behaviour (dispatch, overflow draining, the stop protocol) can be
//! tested deterministically.

use super::{Interest, Message, OsHandle, PollMode, ReactorBackend, Token};
use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::io;

/// Deterministic in-memory reactor for tests.
pub struct LabReactor {
    posted: ArrayQueue<Message>,
    injected: SegQueue<Message>,
    registered: Mutex<HashSet<OsHandle>>,
    armed: Mutex<HashMap<OsHandle, Token>>,
    /// Handles that refuse arming and get synthetic callbacks instead.
    always_ready: Mutex<HashSet<OsHandle>>,
    signal: Mutex<()>,
    available: Condvar,
}

impl LabReactor {
    /// Creates a lab reactor with the default queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(64)
    }

    /// Creates a lab reactor with a bounded posted-queue capacity.
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            posted: ArrayQueue::new(capacity.max(1)),
            injected: SegQueue::new(),
            registered: Mutex::new(HashSet::new()),
            armed: Mutex::new(HashMap::new()),
            always_ready: Mutex::new(HashSet::new()),
            signal: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// Injects readiness for an armed token, as the kernel would.
    pub fn inject_ready(&self, token: Token) {
        self.injected.push(Message::Callback(token));
        self.notify();
    }

    /// Marks a handle as always ready: arming it synthesises an immediate
    /// callback, mirroring regular files under epoll.
    pub fn mark_always_ready(&self, handle: OsHandle) {
        self.always_ready.lock().insert(handle);
    }

    /// Returns the token a handle is currently armed with, if any.
    #[must_use]
    pub fn armed_token(&self, handle: OsHandle) -> Option<Token> {
        self.armed.lock().get(&handle).copied()
    }

    fn notify(&self) {
        let _guard = self.signal.lock();
        self.available.notify_all();
    }

    fn dequeue(&self) -> Option<Message> {
        self.injected.pop().or_else(|| self.posted.pop())
    }
}

impl Default for LabReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBackend for LabReactor {
    fn register(&self, handle: OsHandle) -> io::Result<()> {
        self.registered.lock().insert(handle);
        Ok(())
    }

    fn unregister(&self, handle: OsHandle) -> io::Result<()> {
        self.armed.lock().remove(&handle);
        self.registered.lock().remove(&handle);
        Ok(())
    }

    fn arm(&self, handle: OsHandle, token: Token, interest: Interest) -> io::Result<()> {
        let _ = interest;
        if self.always_ready.lock().contains(&handle) {
            self.post_callback(token);
            return Ok(());
        }
        let mut armed = self.armed.lock();
        match armed.get(&handle) {
            Some(&existing) if existing != token => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "handle armed for another operation",
            )),
            _ => {
                armed.insert(handle, token);
                Ok(())
            }
        }
    }

    fn disarm(&self, handle: OsHandle) -> io::Result<()> {
        self.armed.lock().remove(&handle);
        Ok(())
    }

    fn post(&self, message: Message) -> Result<(), Message> {
        self.posted.push(message)?;
        self.notify();
        Ok(())
    }

    fn post_callback(&self, token: Token) {
        self.injected.push(Message::Callback(token));
        self.notify();
    }

    fn poll(&self, mode: PollMode) -> io::Result<Option<Message>> {
        if let Some(message) = self.dequeue() {
            return Ok(Some(message));
        }
        match mode {
            PollMode::NonBlock => Ok(None),
            PollMode::Block => {
                let mut guard = self.signal.lock();
                loop {
                    if let Some(message) = self.dequeue() {
                        return Ok(Some(message));
                    }
                    self.available.wait(&mut guard);
                }
            }
        }
    }

    fn wake(&self) {
        // Unbounded in the lab so a stop wakeup can never be lost.
        self.injected.push(Message::Wakeup);
        self.notify();
    }

    fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }
}

impl std::fmt::Debug for LabReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabReactor")
            .field("registered", &self.registered.lock().len())
            .field("armed", &self.armed.lock().len())
            .finish_non_exhaustive()
    }
}
