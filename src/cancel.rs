//! Cancellation tokens with scoped callback registration.
//!
//! A [`CancelSource`] is the requesting side: calling
//! [`request_cancel`](CancelSource::request_cancel) latches the observable
//! flag and invokes every registered callback. A [`CancelToken`] is the
//! observing side, cheaply cloneable and shared with the operations that
//! should honour the request. A [`CancelRegistration`] scopes a callback to
//! a region of code: dropping it detaches the callback atomically.
//!
//! # Registration guarantees
//!
//! - A callback runs at most once.
//! - Registering against an already-cancelled token runs the callback
//!   immediately, on the registering thread.
//! - After [`CancelRegistration`] is dropped, the callback is not running
//!   and will never run. If the callback is mid-invocation on another
//!   thread, drop blocks until it finishes. Dropping from inside the
//!   callback itself does not block.
//!
//! The immediate-run and drop-blocks rules are what let an operation
//! release its registration *before* extracting its result, so that a token
//! shared across combinator legs is freed as soon as each leg settles.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

type Callback = Box<dyn FnOnce() + Send>;

struct RegState {
    callbacks: HashMap<u64, Callback>,
    /// Key and thread of the callback currently being invoked, if any.
    running: Option<(u64, ThreadId)>,
}

struct TokenCore {
    cancelled: AtomicBool,
    /// Number of live `CancelSource` handles.
    source_count: AtomicU32,
    next_key: AtomicU64,
    regs: Mutex<RegState>,
    /// Signalled when `running` clears, so a detaching drop can wait.
    unblocked: Condvar,
}

impl TokenCore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            source_count: AtomicU32::new(1),
            next_key: AtomicU64::new(0),
            regs: Mutex::new(RegState {
                callbacks: HashMap::new(),
                running: None,
            }),
            unblocked: Condvar::new(),
        })
    }

    fn request_cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Invoke callbacks one at a time, outside the map lock, tracking
        // the in-flight key so a concurrent detach can wait it out.
        loop {
            let mut state = self.regs.lock();
            let Some(&key) = state.callbacks.keys().next() else {
                break;
            };
            let callback = state.callbacks.remove(&key).expect("key just observed");
            state.running = Some((key, thread::current().id()));
            drop(state);

            callback();

            let mut state = self.regs.lock();
            state.running = None;
            drop(state);
            self.unblocked.notify_all();
        }
    }
}

/// The requesting side of a cancellation pair.
///
/// Dropping every source makes the associated tokens report
/// `can_be_cancelled() == false` (unless cancellation was already
/// requested, which is permanent).
pub struct CancelSource {
    core: Arc<TokenCore>,
}

impl CancelSource {
    /// Creates a new cancellation source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: TokenCore::new(),
        }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            core: Some(self.core.clone()),
        }
    }

    /// Latches the cancellation flag and invokes all registered callbacks.
    ///
    /// Idempotent: only the first call invokes callbacks.
    pub fn request_cancel(&self) {
        self.core.request_cancel();
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.core.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CancelSource {
    fn clone(&self) -> Self {
        self.core.source_count.fetch_add(1, Ordering::Relaxed);
        Self {
            core: self.core.clone(),
        }
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        self.core.source_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSource")
            .field("cancelled", &self.is_cancellation_requested())
            .finish_non_exhaustive()
    }
}

/// The observing side of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    core: Option<Arc<TokenCore>>,
}

impl CancelToken {
    /// Returns a token that can never be cancelled.
    ///
    /// Operations given this token take the non-cancellable fast path: no
    /// callback registration, no phase handoff.
    #[must_use]
    pub const fn none() -> Self {
        Self { core: None }
    }

    /// Returns true if cancellation could still be requested: a source is
    /// alive, or cancellation has already happened.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        match &self.core {
            None => false,
            Some(core) => {
                core.cancelled.load(Ordering::Acquire)
                    || core.source_count.load(Ordering::Acquire) > 0
            }
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.cancelled.load(Ordering::Acquire))
    }

    /// Registers a callback to run when cancellation is requested.
    ///
    /// If cancellation was already requested, the callback runs immediately
    /// on this thread and the returned registration is inert. If the token
    /// cannot be cancelled, the callback is dropped without running.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> CancelRegistration {
        let Some(core) = &self.core else {
            return CancelRegistration { core: None, key: 0 };
        };
        if !self.can_be_cancelled() {
            return CancelRegistration { core: None, key: 0 };
        }
        if core.cancelled.load(Ordering::Acquire) {
            callback();
            return CancelRegistration { core: None, key: 0 };
        }
        let key = core.next_key.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = core.regs.lock();
            state.callbacks.insert(key, Box::new(callback));
        }
        // The flag may have latched while we were inserting; make sure the
        // callback is not stranded in the map.
        if core.cancelled.load(Ordering::Acquire) {
            let taken = core.regs.lock().callbacks.remove(&key);
            if let Some(callback) = taken {
                callback();
            }
            return CancelRegistration { core: None, key: 0 };
        }
        CancelRegistration {
            core: Some(core.clone()),
            key,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("can_be_cancelled", &self.can_be_cancelled())
            .field("requested", &self.is_cancellation_requested())
            .finish()
    }
}

/// Scoped binding of a (token, callback) pair.
///
/// Dropping the registration detaches the callback. See the module docs
/// for the exact guarantees.
pub struct CancelRegistration {
    core: Option<Arc<TokenCore>>,
    key: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        let mut state = core.regs.lock();
        state.callbacks.remove(&self.key);
        // If our callback is mid-invocation on another thread, wait for it.
        while let Some((key, tid)) = state.running {
            if key == self.key && tid != thread::current().id() {
                core.unblocked.wait(&mut state);
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("attached", &self.core.is_some())
            .finish()
    }
}
