//! Completion-port backend surface (Windows).
//!
//! On Windows the reactor is built on I/O completion ports, a *completion*
//! model: the syscall that starts an operation already carries the
//! completion cookie, so [`arm`](crate::reactor::ReactorBackend::arm) is a
//! no-op and the port surfaces completion messages as-is. Registration
//! associates the handle with the port once for the handle's lifetime.
//!
//! The production backend is gated on `cfg(windows)`; a typed stub keeps
//! docs and builds consistent elsewhere.

use super::{Interest, Message, OsHandle, PollMode, ReactorBackend, Token};
use std::io;

#[cfg(windows)]
mod iocp_impl {
    use super::{Interest, Message, OsHandle, PollMode, ReactorBackend, Token};
    use std::io;

    /// Completion-port reactor (Windows).
    #[derive(Debug, Default)]
    pub struct IocpReactor;

    impl IocpReactor {
        /// Creates a new completion-port reactor.
        ///
        /// # Errors
        ///
        /// Returns `Unsupported` until the port backend is implemented.
        pub fn new() -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is not implemented yet",
            ))
        }
    }

    impl ReactorBackend for IocpReactor {
        fn register(&self, _handle: OsHandle) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is not implemented yet",
            ))
        }

        fn unregister(&self, _handle: OsHandle) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is not implemented yet",
            ))
        }

        fn arm(&self, _handle: OsHandle, _token: Token, _interest: Interest) -> io::Result<()> {
            // Completion-model: the overlapped syscall carries the cookie.
            Ok(())
        }

        fn disarm(&self, _handle: OsHandle) -> io::Result<()> {
            Ok(())
        }

        fn post(&self, message: Message) -> Result<(), Message> {
            Err(message)
        }

        fn post_callback(&self, _token: Token) {}

        fn poll(&self, _mode: PollMode) -> io::Result<Option<Message>> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is not implemented yet",
            ))
        }

        fn wake(&self) {}

        fn registered_count(&self) -> usize {
            0
        }
    }
}

// Stub for non-Windows platforms (keeps docs/builds consistent).
#[cfg(not(windows))]
mod stub {
    use super::{Interest, Message, OsHandle, PollMode, ReactorBackend, Token};
    use std::io;

    /// Completion-port reactor (Windows-only).
    #[derive(Debug, Default)]
    pub struct IocpReactor;

    impl IocpReactor {
        /// Creates a new completion-port reactor.
        ///
        /// # Errors
        ///
        /// Always returns `Unsupported` on non-Windows platforms.
        pub fn new() -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is only available on Windows",
            ))
        }
    }

    impl ReactorBackend for IocpReactor {
        fn register(&self, _handle: OsHandle) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is only available on Windows",
            ))
        }

        fn unregister(&self, _handle: OsHandle) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is only available on Windows",
            ))
        }

        fn arm(&self, _handle: OsHandle, _token: Token, _interest: Interest) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is only available on Windows",
            ))
        }

        fn disarm(&self, _handle: OsHandle) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is only available on Windows",
            ))
        }

        fn post(&self, message: Message) -> Result<(), Message> {
            Err(message)
        }

        fn post_callback(&self, _token: Token) {}

        fn poll(&self, _mode: PollMode) -> io::Result<Option<Message>> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IocpReactor is only available on Windows",
            ))
        }

        fn wake(&self) {}

        fn registered_count(&self) -> usize {
            0
        }
    }
}

#[cfg(windows)]
pub use iocp_impl::IocpReactor;

#[cfg(not(windows))]
pub use stub::IocpReactor;
