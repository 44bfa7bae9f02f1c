//! The promise side: single-use write handle over the result cell.

use std::sync::Arc;

use super::co_future::{CoFuture, FutureInner};
use crate::error::{Error, Result};

/// The write handle of a single-assignment result cell.
///
/// Resolution is single-assignment: the first `complete`/`success`/`fail`
/// across all clones wins, later calls are no-ops. Dropping the last
/// promise handle without resolving breaks the future
/// ([`crate::error::ErrorKind::Broken`]) so registered callbacks are never
/// silently lost.
pub struct CoPromise<T: Send + 'static> {
    inner: Arc<FutureInner<T>>,
}

impl<T: Send + 'static> CoPromise<T> {
    /// Creates an unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: FutureInner::new(1),
        }
    }

    /// Returns a read handle sharing this promise's result cell.
    #[must_use]
    pub fn future(&self) -> CoFuture<T> {
        CoFuture::from_inner(Arc::clone(&self.inner))
    }

    /// Resolves with `outcome`. Returns false on the no-op path.
    pub fn complete(&self, outcome: Result<T>) -> bool {
        self.inner.complete(outcome)
    }

    /// Resolves successfully with `value`. Returns false on the no-op path.
    pub fn success(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Resolves with `error`. Returns false on the no-op path.
    pub fn fail(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Attempts to resolve with cancellation; no-op if already resolved.
    pub fn cancel(&self) {
        self.inner.cancel_inner();
    }

    /// True once the cell has resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.is_resolved()
    }
}

impl<T: Send + 'static> Default for CoPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Clone for CoPromise<T> {
    fn clone(&self) -> Self {
        self.inner.add_promise();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Drop for CoPromise<T> {
    fn drop(&mut self) {
        self.inner.release_promise();
    }
}

impl<T: Send + 'static> std::fmt::Debug for CoPromise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoPromise").finish_non_exhaustive()
    }
}
