//! The future side: awaitable, mappable read handle over the result cell.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::coroutine::{self, ResumeHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::timer;
use crate::util::callback_stack::CallbackStack;

/// No result yet.
const PENDING: u8 = 0;
/// A completer won the CAS and is writing the result.
const RESOLVING: u8 = 1;
/// Result available; callbacks closed.
const RESOLVED: u8 = 2;

/// Cancellation propagation toward the root of a `map`/`flat_map` chain.
///
/// The child holds only a `Weak` to its parent: the back-reference must not
/// keep the parent alive once no other consumer exists.
pub(crate) trait CancelPropagate: Send + Sync {
    fn propagate_cancel(&self);
}

/// The shared single-assignment result cell.
pub(crate) struct FutureInner<T> {
    state: AtomicU8,
    result: UnsafeCell<Option<Result<T>>>,
    callbacks: CallbackStack<Result<T>>,
    /// Live promise handles; the last one to drop breaks a pending future.
    promises: AtomicUsize,
    parent: Mutex<Option<Weak<dyn CancelPropagate>>>,
}

// SAFETY: `result` is written exactly once by the CAS winner
// (pending→resolving) and only read after `resolved` is observed; the state
// atomic orders the accesses.
unsafe impl<T: Send> Send for FutureInner<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for FutureInner<T> {}

impl<T: Send + 'static> FutureInner<T> {
    pub(crate) fn new(promises: usize) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            result: UnsafeCell::new(None),
            callbacks: CallbackStack::new(),
            promises: AtomicUsize::new(promises),
            parent: Mutex::new(None),
        })
    }

    pub(crate) fn set_parent(&self, parent: Weak<dyn CancelPropagate>) {
        *self.parent.lock() = Some(parent);
    }

    /// Installs the result if still pending. Returns false on the no-op
    /// path (someone already resolved).
    pub(crate) fn complete(&self, outcome: Result<T>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, RESOLVING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        // SAFETY: the CAS above makes this the unique writer.
        unsafe { *self.result.get() = Some(outcome) };
        self.state.store(RESOLVED, Ordering::SeqCst);
        self.callbacks.close(self.result_ref());
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RESOLVED
    }

    /// Reference to the stored result. Only valid after resolution.
    fn result_ref(&self) -> &Result<T> {
        debug_assert!(self.is_resolved());
        // SAFETY: after `resolved` the cell is immutable and populated.
        unsafe { (*self.result.get()).as_ref() }.expect("resolved future without a result")
    }

    /// Registers a completion callback with the exactly-once guarantee.
    pub(crate) fn when_complete_inner(&self, callback: Box<dyn FnOnce(&Result<T>) + Send>) {
        if let Err(callback) = self.callbacks.push(callback) {
            // Closed between our check and push: fire inline.
            callback(self.result_ref());
        }
    }

    /// Attempts cancellation; on success propagates toward the root.
    pub(crate) fn cancel_inner(&self) {
        if self.complete(Err(Error::new(ErrorKind::Cancelled))) {
            let parent = self.parent.lock().take();
            if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
                parent.propagate_cancel();
            }
        }
    }

    pub(crate) fn add_promise(&self) {
        self.promises.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one promise handle; the last unresolved drop breaks the future.
    pub(crate) fn release_promise(&self) {
        if self.promises.fetch_sub(1, Ordering::AcqRel) == 1 && !self.is_resolved() {
            tracing::debug!("promise dropped without resolution; breaking future");
            self.complete(Err(Error::new(ErrorKind::Broken)));
        }
    }
}

impl<T: Send + 'static> CancelPropagate for FutureInner<T> {
    fn propagate_cancel(&self) {
        self.cancel_inner();
    }
}

impl<T> Drop for FutureInner<T> {
    fn drop(&mut self) {
        // Pending callbacks must not be silently lost: destruction resolves
        // with a terminal error and fires them.
        if self.state.load(Ordering::SeqCst) != RESOLVED {
            let broken: Result<T> = Err(Error::new(ErrorKind::Broken));
            self.callbacks.close(&broken);
        }
    }
}

/// The read handle of a single-assignment result cell.
///
/// Cloning shares the cell; every clone (and every callback) observes the
/// same resolution.
pub struct CoFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for CoFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for CoFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoFuture")
            .field("resolved", &(self.inner.state.load(Ordering::SeqCst) == RESOLVED))
            .finish()
    }
}

impl<T: Send + 'static> CoFuture<T> {
    pub(crate) fn from_inner(inner: Arc<FutureInner<T>>) -> Self {
        Self { inner }
    }

    /// Creates an already-successful future.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let inner = FutureInner::new(0);
        inner.complete(Ok(value));
        Self { inner }
    }

    /// Creates an already-failed future.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        let inner = FutureInner::new(0);
        inner.complete(Err(error));
        Self { inner }
    }

    /// True once the future has resolved (success or failure).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.is_resolved()
    }

    /// True iff the future resolved with cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_resolved()
            && matches!(self.inner.result_ref(), Err(e) if e.kind() == ErrorKind::Cancelled)
    }

    /// Registers a callback fired exactly once with the final result.
    ///
    /// Fires inline on the registering thread when already resolved.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        self.inner.when_complete_inner(Box::new(callback));
    }

    /// Registers a callback fired only on success.
    pub fn when_success<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.when_complete(|result| {
            if let Ok(value) = result {
                callback(value);
            }
        });
    }

    /// Registers a callback fired only on failure.
    pub fn when_failure<F>(&self, callback: F)
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        self.when_complete(|result| {
            if let Err(error) = result {
                callback(error);
            }
        });
    }

    /// Attempts to cancel: resolves with `Cancelled` unless already
    /// resolved, and propagates toward the root of a derivation chain.
    pub fn cancel(&self) {
        self.inner.cancel_inner();
    }
}

impl<T: Clone + Send + 'static> CoFuture<T> {
    /// Returns the result if resolved, without suspending.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T>> {
        self.inner.is_resolved().then(|| self.inner.result_ref().clone())
    }

    /// Awaits resolution inside a coroutine.
    ///
    /// Already-resolved futures return without a context switch.
    ///
    /// # Errors
    ///
    /// The future's own failure, or [`ErrorKind::NotInsideCoroutine`].
    pub fn await_result(&self) -> Result<T> {
        if let Some(result) = self.try_result() {
            return result;
        }
        let inner = Arc::clone(&self.inner);
        coroutine::await_callback(move |resume: ResumeHandle<Result<T>>| {
            inner.when_complete_inner(Box::new(move |result| resume.resume(result.clone())));
        })?
    }

    /// Awaits resolution with a timeout.
    ///
    /// A zero timeout short-circuits: resolved futures return their result,
    /// unresolved ones fail with [`ErrorKind::Timeout`] immediately. The
    /// timeout resolves only this await; the future itself stays pending
    /// and a later resolution is a no-op for this awaiter.
    pub fn await_timeout(&self, timeout: Duration) -> Result<T> {
        if let Some(result) = self.try_result() {
            return result;
        }
        if timeout.is_zero() {
            return Err(Error::new(ErrorKind::Timeout));
        }
        let submitter = crate::coroutine::current_submitter().ok_or_else(|| {
            Error::new(ErrorKind::NotInsideCoroutine).with_context("await requires a coroutine")
        })?;
        let inner = Arc::clone(&self.inner);
        coroutine::await_callback(move |resume: ResumeHandle<Result<T>>| {
            let deadline_resume = resume.clone();
            timer::submit_after(
                submitter,
                timeout,
                Box::new(move || deadline_resume.resume(Err(Error::new(ErrorKind::Timeout)))),
            );
            inner.when_complete_inner(Box::new(move |result| resume.resume(result.clone())));
        })?
    }

    /// Blocks the calling OS thread until resolution. A bridge for
    /// non-coroutine threads (tests, `main`).
    pub fn wait_blocking(&self) -> Result<T> {
        let (sender, receiver) = std::sync::mpsc::channel();
        self.when_complete(move |result| {
            let _ = sender.send(result.clone());
        });
        receiver
            .recv()
            .unwrap_or_else(|_| Err(Error::new(ErrorKind::Broken)))
    }

    /// Derives a future by transforming the success value.
    ///
    /// Cancelling the child propagates to this future (and further toward
    /// the root); resolving this future resolves the child through `f`.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> CoFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let child = FutureInner::<U>::new(0);
        child.set_parent(Arc::downgrade(&self.inner) as Weak<dyn CancelPropagate>);
        let resolver = Arc::clone(&child);
        self.when_complete(move |result| {
            let outcome = match result {
                Ok(value) => f(value.clone()),
                Err(error) => Err(error.clone()),
            };
            resolver.complete(outcome);
        });
        CoFuture { inner: child }
    }

    /// Derives a future by chaining an asynchronous continuation.
    #[must_use]
    pub fn flat_map<U, F>(&self, f: F) -> CoFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> CoFuture<U> + Send + 'static,
    {
        let child = FutureInner::<U>::new(0);
        child.set_parent(Arc::downgrade(&self.inner) as Weak<dyn CancelPropagate>);
        let resolver = Arc::clone(&child);
        self.when_complete(move |result| match result {
            Ok(value) => {
                let next = f(value.clone());
                next.when_complete(move |outcome| {
                    resolver.complete(outcome.clone());
                });
            }
            Err(error) => {
                resolver.complete(Err(error.clone()));
            }
        });
        CoFuture { inner: child }
    }
}
