//! Error types and error handling strategy for Cofiber.
//!
//! This module defines the core error types used throughout the runtime.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Terminal errors (cancellation, close, timeout) surface at the next await
//! - Panics in coroutine bodies are isolated at the entry frame

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Futures ===
    /// The future was cancelled, explicitly or via a scope or parent.
    Cancelled,
    /// An awaited future did not resolve within the given duration.
    Timeout,
    /// The promise was dropped without resolution.
    Broken,

    // === Channels ===
    /// The channel was closed; receive after the buffer drained, or send after close.
    ChannelClosed,
    /// The channel was cancelled.
    ChannelCancelled,

    // === Coroutines ===
    /// An await primitive was called outside a coroutine context.
    NotInsideCoroutine,

    // === Internal / user ===
    /// Internal runtime error (bug).
    Internal,
    /// User-provided error.
    User,
}

/// The main error type for Cofiber operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
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

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation of any primitive.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled | ErrorKind::ChannelCancelled)
    }

    /// Returns true if this error is a timed-out await.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error reports a closed channel.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ChannelClosed)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a user error wrapping an arbitrary error value.
    #[must_use]
    pub fn user(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Cofiber operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Broken);
        assert_eq!(err.to_string(), "Broken");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::ChannelClosed).with_context("after drain");
        assert_eq!(err.to_string(), "ChannelClosed: after drain");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::user(Underlying).with_context("outer");
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        let cancel = Error::new(ErrorKind::Cancelled);
        assert!(cancel.is_cancelled());
        assert!(!cancel.is_timeout());

        let chan = Error::new(ErrorKind::ChannelCancelled);
        assert!(chan.is_cancelled());
        assert!(!chan.is_closed());

        let timeout = Error::new(ErrorKind::Timeout);
        assert!(!timeout.is_cancelled());
        assert!(timeout.is_timeout());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::Timeout));
        let err = res.context("await timed out").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "Timeout: await timed out");
    }
}
