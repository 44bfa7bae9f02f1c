//! Receive-side wrappers: element transformation and iteration.

use std::sync::Arc;

use super::co_channel::ChannelInner;
use crate::coroutine;
use crate::error::Result;

/// A receiver that transforms every element it delivers.
///
/// The underlying channel's lifecycle is shared with whoever else holds it;
/// closing or cancelling through the wrapper affects them all.
pub struct MapReceiver<T, U> {
    inner: Arc<ChannelInner<T>>,
    transform: Arc<dyn Fn(T) -> U + Send + Sync>,
}

impl<T, U> Clone for MapReceiver<T, U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<T, U> std::fmt::Debug for MapReceiver<T, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapReceiver").finish_non_exhaustive()
    }
}

impl<T: Send + 'static, U: Send + 'static> MapReceiver<T, U> {
    pub(crate) fn new(
        inner: Arc<ChannelInner<T>>,
        transform: Arc<dyn Fn(T) -> U + Send + Sync>,
    ) -> Self {
        Self { inner, transform }
    }

    /// Receives inside a coroutine, suspending while the buffer is empty.
    pub fn await_receive(&self) -> Result<U> {
        self.inner.await_receive().map(|value| (self.transform)(value))
    }

    /// Non-suspending receive of a transformed buffered element.
    pub fn poll(&self) -> Option<U> {
        self.inner.poll().map(|value| (self.transform)(value))
    }

    /// Registers a one-shot receive callback for the next element.
    pub fn when_receive<F>(&self, callback: F)
    where
        F: FnOnce(Result<U>) + Send + 'static,
    {
        let transform = Arc::clone(&self.transform);
        self.inner.when_receive(Box::new(move |result| {
            callback(result.map(|value| transform(value)));
        }));
    }

    /// Registers a completion callback on the shared channel.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.when_complete_inner(Box::new(callback));
    }

    /// Closes the shared channel.
    pub fn close(&self) -> bool {
        self.inner.close()
    }

    /// Cancels the shared channel.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// True once the shared channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.mode() == super::co_channel::MODE_CLOSED
    }

    /// True once the shared channel is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.mode() == super::co_channel::MODE_CANCELLED
    }

    /// Stacks another transformation on top of this receiver.
    #[must_use]
    pub fn map<V, F>(&self, transform: F) -> MapReceiver<T, V>
    where
        V: Send + 'static,
        F: Fn(U) -> V + Send + Sync + 'static,
    {
        let first = Arc::clone(&self.transform);
        MapReceiver::new(
            Arc::clone(&self.inner),
            Arc::new(move |value| transform(first(value))),
        )
    }

    /// An iterator over transformed elements; awaits inside a coroutine,
    /// polls outside.
    #[must_use]
    pub fn iter(&self) -> MapIter<T, U> {
        MapIter {
            receiver: self.clone(),
        }
    }
}

/// Iterator over a channel's elements.
///
/// Inside a coroutine, `next` suspends on an empty buffer and ends at the
/// terminal transition; outside, it polls and ends at the first empty poll.
pub struct ChannelIter<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Send + 'static> ChannelIter<T> {
    pub(crate) fn new(inner: Arc<ChannelInner<T>>) -> Self {
        Self { inner }
    }
}

impl<T: Send + 'static> Iterator for ChannelIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if coroutine::is_inside() {
            self.inner.await_receive().ok()
        } else {
            self.inner.poll()
        }
    }
}

/// Iterator over a [`MapReceiver`]'s transformed elements.
pub struct MapIter<T, U> {
    receiver: MapReceiver<T, U>,
}

impl<T: Send + 'static, U: Send + 'static> Iterator for MapIter<T, U> {
    type Item = U;

    fn next(&mut self) -> Option<U> {
        if coroutine::is_inside() {
            self.receiver.await_receive().ok()
        } else {
            self.receiver.poll()
        }
    }
}
