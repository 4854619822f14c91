//! Error types for the I/O runtime core.
//!
//! The core distinguishes exactly two failure classes:
//!
//! - [`ErrorKind::Cancelled`]: the operation was cancelled through its
//!   cancellation token. Combinators rely on this being distinguishable
//!   from I/O failure so they can unwind a lost race without misreporting.
//! - [`ErrorKind::Resource`]: everything else — an OS-level failure carried
//!   as an [`std::io::Error`] (errno / NTSTATUS), surfaced either at
//!   construction (registration, kernel object creation) or at resumption
//!   (asynchronous completion error).
//!
//! Errors are explicit and typed; no stringly-typed errors.

use core::fmt;
use std::io;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled before it completed.
    Cancelled,
    /// An OS resource error (registration, kernel call, completion status).
    Resource,
}

/// The error type produced by the runtime core.
///
/// Cloneable so a single completion error can be observed by multiple
/// combinator legs; the OS source is shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<io::Error>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates a resource error from an OS error.
    #[must_use]
    pub fn resource(source: io::Error) -> Self {
        Self {
            kind: ErrorKind::Resource,
            context: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a resource error from a raw OS error code.
    #[must_use]
    pub fn from_raw_os_error(code: i32) -> Self {
        Self::resource(io::Error::from_raw_os_error(code))
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Returns the raw OS error code, if this error carries one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.as_deref().and_then(io::Error::raw_os_error)
    }

    /// Returns the underlying OS error, if any.
    #[must_use]
    pub fn os_error(&self) -> Option<&io::Error> {
        self.source.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Cancelled => write!(f, "operation cancelled")?,
            ErrorKind::Resource => write!(f, "resource error")?,
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::resource(err)
    }
}

/// Result alias for runtime-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_cancelled() {
        let err = Error::cancelled();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.is_cancelled());
        assert!(err.raw_os_error().is_none());
    }

    #[test]
    fn resource_carries_os_code() {
        let err = Error::from_raw_os_error(11);
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(!err.is_cancelled());
        assert_eq!(err.raw_os_error(), Some(11));
    }

    #[test]
    fn context_appears_in_display() {
        let err = Error::resource(io::Error::new(io::ErrorKind::Other, "boom"))
            .with_context("arming recv");
        let text = err.to_string();
        assert!(text.contains("arming recv"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn from_io_error_is_resource() {
        let err: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn source_chain_is_preserved() {
        let err = Error::resource(io::Error::new(io::ErrorKind::Other, "inner"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("inner"));
    }
}
