//! Single-assignment futures and promises.
//!
//! A [`CoFuture`] is the read handle and a [`CoPromise`] the write handle of
//! one result cell over `Result<T>`. Resolution is monotonic: the first
//! `complete` wins and everything after it is a no-op. Completion callbacks
//! registered before resolution fire exactly once when it happens;
//! callbacks registered after fire inline on the registering thread.
//!
//! Inside a coroutine, [`CoFuture::await_result`] suspends until resolution
//! (without a context switch when already resolved); outside, callbacks or
//! [`CoFuture::wait_blocking`] bridge to ordinary threads.

mod co_future;
mod promise;

pub use co_future::CoFuture;
pub use promise::CoPromise;
