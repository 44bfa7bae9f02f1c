//! Cofiber: stackful coroutines with awaitable futures, channels, and scopes.
//!
//! # Overview
//!
//! Cofiber lets you write asynchronous code in a straight-line style. A
//! coroutine runs on its own stack and suspends at explicit await points,
//! releasing its host thread; the callback it is waiting on resumes it later,
//! possibly on a different thread of an executor.
//!
//! # Core Guarantees
//!
//! - **Single assignment**: a future resolves at most once; later attempts are no-ops
//! - **Exactly-once callbacks**: every registered completion callback fires exactly once,
//!   on resolution, cancellation, or destruction
//! - **FIFO channels**: receive order equals send order; backpressure suspends senders
//! - **Cooperative cancellation**: terminal errors surface at the next await point
//! - **Suspension-free fast paths**: awaiting a resolved future and offering to a
//!   non-full channel never context-switch
//!
//! # Module Structure
//!
//! - [`coroutine`]: the stackful runtime (stacks, context switch, suspend/resume)
//! - [`executor`]: the executor capability and shipped implementations
//! - [`future`]: single-assignment futures and promises
//! - [`channel`]: bounded FIFO channels with suspend-on-full/suspend-on-empty
//! - [`scope`]: cancellation scopes
//! - [`error`]: error types
//! - [`config`]: runtime configuration and environment overrides
//!
//! # Example
//!
//! ```ignore
//! use cofiber::executor::ThreadPoolExecutor;
//!
//! let pool = ThreadPoolExecutor::global();
//! let future = cofiber::coroutine::submit(pool.clone(), || {
//!     // Straight-line code that may suspend at await points.
//!     Ok(40 + 2)
//! });
//! assert_eq!(future.wait_blocking().unwrap(), 42);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod future;
pub mod scope;
#[cfg(feature = "test-util")]
pub mod test_utils;
pub(crate) mod util;

// Re-exports for convenient access to core types
pub use channel::{CoChannel, MapReceiver};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use executor::{
    CoroutineExecutor, DedicatedThreadExecutor, SerialExecutor, ThreadPoolExecutor, Thunk,
};
pub use future::{CoFuture, CoPromise};
pub use scope::{Cancellable, CoScope};
