//! The executor capability and shipped implementations.
//!
//! The runtime consumes exactly one external interface: "schedule this thunk
//! for execution, possibly on another thread". Everything else — which
//! thread, what ordering, how many workers — is the executor's business.
//!
//! # Implementations
//!
//! - [`ThreadPoolExecutor`]: any-thread pool with lazily-spawned workers
//! - [`SerialExecutor`]: strict submission-order execution over any executor
//! - [`DedicatedThreadExecutor`]: one designated thread (the "main thread" role)
//!
//! [`timer`] provides deadline-driven thunk submission for awaits with a
//! timeout.

mod dedicated;
mod serial;
mod thread_pool;
pub mod timer;

use std::sync::Arc;

pub use dedicated::DedicatedThreadExecutor;
pub use serial::SerialExecutor;
pub use thread_pool::ThreadPoolExecutor;

/// A unit of deferred work.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// A capability to schedule a thunk for later execution.
///
/// Any coroutine that may suspend stores one of these as its resume
/// submitter; the resume path submits a "continue the coroutine" thunk
/// through it.
pub trait CoroutineExecutor: Send + Sync + 'static {
    /// Schedules `thunk` to run later, possibly on another thread.
    fn submit(&self, thunk: Thunk);
}

impl<E: CoroutineExecutor + ?Sized> CoroutineExecutor for Arc<E> {
    fn submit(&self, thunk: Thunk) {
        (**self).submit(thunk);
    }
}
