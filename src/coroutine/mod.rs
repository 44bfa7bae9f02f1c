//! The stackful coroutine runtime.
//!
//! A coroutine is a resumable function with its own stack. It suspends only
//! at explicit await points — [`await_callback`], a future await, a channel
//! operation, or [`switch_to`] — and resumes on whatever thread its executor
//! provides. Code between await points is never interrupted.
//!
//! # Launching
//!
//! - [`start`]: fire-and-forget; a panic in the body aborts the process
//! - [`submit`]: returns a [`CoFuture`] carrying the body's result, panic
//!   included
//!
//! # Awaiting
//!
//! [`await_callback`] is the primitive everything else is built on: it hands
//! the registrant a one-shot [`ResumeHandle`] and suspends until the handle
//! is resumed. If the registrant resumes before returning, the suspension is
//! elided and the caller continues on the same stack without a context
//! switch.

mod context;
mod core;
mod pool;
mod stack;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub use self::core::ResumeHandle;

use self::core::CoroutineCore;
use self::pool::StackPool;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::CoroutineExecutor;
use crate::future::{CoFuture, CoPromise};

/// Returns true when called from inside a coroutine.
#[must_use]
pub fn is_inside() -> bool {
    self::core::is_inside()
}

/// Resume submitter of the current coroutine, if inside one.
pub(crate) fn current_submitter() -> Option<Arc<dyn CoroutineExecutor>> {
    self::core::current().map(|coroutine| coroutine.submitter())
}

/// Starts a fire-and-forget coroutine on `executor`.
///
/// The executor doubles as the coroutine's resume submitter: every time the
/// coroutine is resumed after a suspension, the continuation is submitted
/// back to it. A panic in `body` aborts the process; use [`submit`] to
/// surface failures instead.
pub fn start<F>(executor: Arc<dyn CoroutineExecutor>, body: F)
where
    F: FnOnce() + Send + 'static,
{
    let coroutine = CoroutineCore::new(
        Box::new(body),
        Arc::clone(&executor),
        Arc::clone(StackPool::global()),
    );
    executor.submit(Box::new(move || coroutine.enter()));
}

/// Starts a coroutine on `executor` and returns a future for its result.
///
/// Errors returned by `body` and panics raised inside it resolve the future
/// as failed; cancellation of the future surfaces at the body's next await
/// point through whichever primitive it is blocked on.
pub fn submit<T, F>(executor: Arc<dyn CoroutineExecutor>, body: F) -> CoFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let promise = CoPromise::new();
    let future = promise.future();
    start(executor, move || {
        let outcome = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result,
            Err(panic) => Err(Error::new(ErrorKind::Internal).with_context(format!(
                "coroutine panicked: {}",
                self::core::panic_message(panic.as_ref())
            ))),
        };
        promise.complete(outcome);
    });
    future
}

/// Suspends the current coroutine until the [`ResumeHandle`] passed to
/// `register` is resumed, then returns the delivered value.
///
/// `register` typically stores the handle where some completion callback
/// will find it; the handle may be resumed from any thread. Resuming before
/// `register` returns skips the context switch (the awaited work completed
/// synchronously).
///
/// # Errors
///
/// Fails with [`ErrorKind::NotInsideCoroutine`] when called outside a
/// coroutine.
pub fn await_callback<T, F>(register: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(ResumeHandle<T>),
{
    self::core::await_callback(register)
}

/// Suspends the current coroutine and resumes it on `executor`, which also
/// becomes its resume submitter from here on.
///
/// # Errors
///
/// Fails with [`ErrorKind::NotInsideCoroutine`] when called outside a
/// coroutine.
pub fn switch_to(executor: Arc<dyn CoroutineExecutor>) -> Result<()> {
    let coroutine = self::core::current().ok_or_else(|| {
        Error::new(ErrorKind::NotInsideCoroutine).with_context("switch_to requires a coroutine")
    })?;
    coroutine.set_submitter(executor);
    coroutine.request_reschedule();
    coroutine.begin_suspend();
    coroutine.suspend_switch();
    Ok(())
}
