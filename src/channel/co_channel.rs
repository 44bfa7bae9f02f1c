//! Bounded FIFO channel with suspend-on-full send and suspend-on-empty
//! receive.
//!
//! # Atomic protocol
//!
//! The whole lifecycle is one packed word `(count, mode)`:
//!
//! ```text
//! count > 0  ⇒  that many elements buffered (send queue non-empty)
//! count < 0  ⇒  that many receivers waiting (receive queue non-empty)
//! count = 0  ⇒  empty, nobody waiting
//! mode ∈ { open, closed, cancelled }
//! ```
//!
//! Every operation decides its fate with a single CAS on that word, then
//! touches the matching queue. Because the count is reserved before the
//! queue operation lands, a consumer that won the CAS may have to wait a
//! few instructions for the producer's push; the queue helpers spin that
//! gap out.
//!
//! # Terminal lifecycles
//!
//! `close` keeps buffered elements deliverable, fails waiting receivers and
//! waiting senders with `ChannelClosed`, and fires the completion stack once
//! the buffer drains. `cancel` drops buffered elements and fails everyone
//! with `ChannelCancelled` immediately. Dropping the last handle of a
//! non-terminal channel behaves like `cancel` (suspended coroutines are
//! resumed, never leaked).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::coroutine::{self, ResumeHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::future::CoFuture;
use crate::util::atomic::{pack, unpack, update};
use crate::util::callback_stack::CallbackStack;

use super::receiver::{ChannelIter, MapReceiver};

pub(crate) const MODE_OPEN: u8 = 0;
pub(crate) const MODE_CLOSED: u8 = 1;
pub(crate) const MODE_CANCELLED: u8 = 2;

/// A buffered element, paired with its sender's continuation when the
/// sender is suspended on a full buffer.
pub(crate) struct SendBlock<T> {
    pub(crate) element: T,
    pub(crate) resume: Option<Box<dyn FnOnce(Result<()>) + Send>>,
}

pub(crate) type ReceiveCallback<T> = Box<dyn FnOnce(Result<T>) + Send>;

pub(crate) struct ChannelInner<T> {
    /// Packed `(count, mode)`.
    state: AtomicU64,
    /// Buffer capacity; `i64::MAX` for unbounded.
    max_buffer: i64,
    /// Buffered elements and suspended senders, in send order.
    send_queue: Mutex<VecDeque<SendBlock<T>>>,
    /// Waiting receivers, in arrival order.
    receive_queue: Mutex<VecDeque<ReceiveCallback<T>>>,
    /// Fires once, at the terminal transition with a drained buffer.
    completion: CallbackStack<()>,
}

fn closed_error() -> Error {
    Error::new(ErrorKind::ChannelClosed)
}

fn cancelled_error() -> Error {
    Error::new(ErrorKind::ChannelCancelled)
}

fn terminal_error(mode: u8) -> Error {
    match mode {
        MODE_CLOSED => closed_error(),
        _ => cancelled_error(),
    }
}

impl<T: Send + 'static> ChannelInner<T> {
    fn new(max_buffer: i64) -> Self {
        Self {
            state: AtomicU64::new(pack(0, MODE_OPEN)),
            max_buffer,
            send_queue: Mutex::new(VecDeque::new()),
            receive_queue: Mutex::new(VecDeque::new()),
            completion: CallbackStack::new(),
        }
    }

    /// Pops the oldest send block, waiting out the window between a
    /// winning CAS and the corresponding push.
    fn pop_send_block(&self) -> SendBlock<T> {
        loop {
            if let Some(block) = self.send_queue.lock().pop_front() {
                return block;
            }
            std::hint::spin_loop();
        }
    }

    /// Pops the oldest waiting receiver; see [`Self::pop_send_block`].
    fn pop_receive_callback(&self) -> ReceiveCallback<T> {
        loop {
            if let Some(callback) = self.receive_queue.lock().pop_front() {
                return callback;
            }
            std::hint::spin_loop();
        }
    }

    fn fire_completion(&self) {
        if self.completion.close(&()) {
            tracing::trace!("channel completion fired");
        }
    }

    pub(crate) fn mode(&self) -> u8 {
        unpack(self.state.load(Ordering::SeqCst)).1
    }

    pub(crate) fn count(&self) -> i64 {
        unpack(self.state.load(Ordering::SeqCst)).0
    }

    /// Non-suspending send: buffer or hand off, never wait.
    pub(crate) fn offer(&self, element: T) -> bool {
        let (old, new) = update(&self.state, |word| {
            let (count, mode) = unpack(word);
            (mode == MODE_OPEN && (count < 0 || count < self.max_buffer))
                .then(|| pack(count + 1, mode))
        });
        if new.is_none() {
            return false;
        }
        let (count, _) = unpack(old);
        if count < 0 {
            // Hand off directly to the oldest waiting receiver.
            self.pop_receive_callback()(Ok(element));
        } else {
            self.send_queue.lock().push_back(SendBlock {
                element,
                resume: None,
            });
        }
        true
    }

    /// Suspending send: buffer, hand off, or park until space frees.
    pub(crate) fn await_send(&self, element: T) -> Result<()> {
        if !coroutine::is_inside() {
            return Err(Error::new(ErrorKind::NotInsideCoroutine)
                .with_context("await_send requires a coroutine"));
        }
        let (old, new) = update(&self.state, |word| {
            let (count, mode) = unpack(word);
            (mode == MODE_OPEN).then(|| pack(count + 1, mode))
        });
        let Some(_) = new else {
            let (_, mode) = unpack(old);
            return Err(terminal_error(mode));
        };
        let (count, _) = unpack(old);
        if count < 0 {
            self.pop_receive_callback()(Ok(element));
            Ok(())
        } else if count < self.max_buffer {
            self.send_queue.lock().push_back(SendBlock {
                element,
                resume: None,
            });
            Ok(())
        } else {
            // Buffer full: park with the element until a receiver takes it
            // (or a terminal transition fails the send).
            coroutine::await_callback(move |resume: ResumeHandle<Result<()>>| {
                self.send_queue.lock().push_back(SendBlock {
                    element,
                    resume: Some(Box::new(move |outcome| resume.resume(outcome))),
                });
            })?
        }
    }

    /// One-shot receive: deliver now, park the callback, or fail terminally.
    pub(crate) fn when_receive(&self, callback: ReceiveCallback<T>) {
        let (old, new) = update(&self.state, |word| {
            let (count, mode) = unpack(word);
            match mode {
                MODE_OPEN => Some(pack(count - 1, mode)),
                MODE_CLOSED if count > 0 => Some(pack(count - 1, mode)),
                _ => None,
            }
        });
        let Some(_) = new else {
            let (_, mode) = unpack(old);
            callback(Err(terminal_error(mode)));
            return;
        };
        let (count, mode) = unpack(old);
        if count > 0 {
            let block = self.pop_send_block();
            if let Some(resume) = block.resume {
                // A suspended sender: its send completed if we are open;
                // a sender that raced a close learns of the close here.
                if mode == MODE_OPEN {
                    resume(Ok(()));
                } else {
                    resume(Err(closed_error()));
                }
            }
            if mode == MODE_CLOSED && count == 1 {
                // Last buffered element of a closed channel.
                self.fire_completion();
            }
            callback(Ok(block.element));
        } else {
            self.receive_queue.lock().push_back(callback);
        }
    }

    /// Suspending receive.
    pub(crate) fn await_receive(&self) -> Result<T> {
        if !coroutine::is_inside() {
            return Err(Error::new(ErrorKind::NotInsideCoroutine)
                .with_context("await_receive requires a coroutine"));
        }
        coroutine::await_callback(move |resume: ResumeHandle<Result<T>>| {
            self.when_receive(Box::new(move |outcome| resume.resume(outcome)));
        })?
    }

    /// Non-suspending receive of a buffered element.
    pub(crate) fn poll(&self) -> Option<T> {
        let (old, new) = update(&self.state, |word| {
            let (count, mode) = unpack(word);
            (count > 0 && mode != MODE_CANCELLED).then(|| pack(count - 1, mode))
        });
        new?;
        let (count, mode) = unpack(old);
        let block = self.pop_send_block();
        if let Some(resume) = block.resume {
            if mode == MODE_OPEN {
                resume(Ok(()));
            } else {
                resume(Err(closed_error()));
            }
        }
        if mode == MODE_CLOSED && count == 1 {
            self.fire_completion();
        }
        Some(block.element)
    }

    /// Terminal transition to closed. Returns true on the first close only.
    pub(crate) fn close(&self) -> bool {
        let (old, new) = update(&self.state, |word| {
            let (count, mode) = unpack(word);
            (mode == MODE_OPEN).then(|| pack(count.max(0), MODE_CLOSED))
        });
        if new.is_none() {
            return false;
        }
        let (count, _) = unpack(old);
        tracing::debug!(count, "channel closed");
        if count < 0 {
            for _ in 0..-count {
                self.pop_receive_callback()(Err(closed_error()));
            }
            self.fire_completion();
        } else if count == 0 {
            self.fire_completion();
        } else {
            // Waiting senders learn of the close now; their elements stay
            // in the buffer, still deliverable in FIFO order. A sender
            // whose push is still in flight is caught at delivery instead.
            let mut to_resume = Vec::new();
            {
                let mut queue = self.send_queue.lock();
                for block in queue.iter_mut() {
                    if let Some(resume) = block.resume.take() {
                        to_resume.push(resume);
                    }
                }
            }
            for resume in to_resume {
                resume(Err(closed_error()));
            }
        }
        true
    }

    /// Terminal transition to cancelled: drops the buffer, fails everyone.
    pub(crate) fn cancel(&self) {
        let (old, new) = update(&self.state, |word| {
            let (_, mode) = unpack(word);
            (mode != MODE_CANCELLED).then(|| pack(0, MODE_CANCELLED))
        });
        if new.is_none() {
            return;
        }
        let (count, _) = unpack(old);
        tracing::debug!(count, "channel cancelled");
        if count < 0 {
            for _ in 0..-count {
                self.pop_receive_callback()(Err(cancelled_error()));
            }
        } else if count > 0 {
            for _ in 0..count {
                let block = self.pop_send_block();
                if let Some(resume) = block.resume {
                    resume(Err(cancelled_error()));
                }
                // Buffered element dropped.
            }
        }
        self.fire_completion();
    }

    /// Registers a completion callback (terminal transition with a drained
    /// buffer); fires inline when that already happened.
    pub(crate) fn when_complete_inner(&self, callback: Box<dyn FnOnce() + Send>) {
        if let Err(callback) = self.completion.push(Box::new(move |()| callback())) {
            callback(&());
        }
    }
}

impl<T> Drop for ChannelInner<T> {
    fn drop(&mut self) {
        // Suspended coroutines must be resumed, not leaked: destruction of
        // a non-terminal channel behaves like cancel.
        let receivers: Vec<_> = self.receive_queue.get_mut().drain(..).collect();
        let senders: Vec<_> = self.send_queue.get_mut().drain(..).collect();
        if !receivers.is_empty() || !senders.is_empty() {
            tracing::debug!(
                receivers = receivers.len(),
                senders = senders.len(),
                "channel dropped with waiters; cancelling them"
            );
        }
        for callback in receivers {
            callback(Err(cancelled_error()));
        }
        for block in senders {
            if let Some(resume) = block.resume {
                resume(Err(cancelled_error()));
            }
        }
        self.completion.close(&());
    }
}

/// A bounded FIFO channel shared by cloning.
///
/// All clones operate on the same channel; the last clone to drop cancels
/// a channel that never reached a terminal state.
pub struct CoChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for CoChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for CoChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (count, mode) = unpack(self.inner.state.load(Ordering::SeqCst));
        f.debug_struct("CoChannel")
            .field("count", &count)
            .field("mode", &mode)
            .field("max_buffer", &self.inner.max_buffer)
            .finish()
    }
}

impl<T: Send + 'static> CoChannel<T> {
    /// Creates a channel buffering at most `max_buffer` elements.
    ///
    /// `max_buffer == 0` makes a rendezvous channel: every send suspends
    /// unless a receiver is already waiting.
    #[must_use]
    pub fn new(max_buffer: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner::new(
                i64::try_from(max_buffer).unwrap_or(i64::MAX),
            )),
        }
    }

    /// Creates a channel with an unbounded buffer.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            inner: Arc::new(ChannelInner::new(i64::MAX)),
        }
    }

    /// Sends inside a coroutine, suspending while the buffer is full.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ChannelClosed`] / [`ErrorKind::ChannelCancelled`] after
    /// a terminal transition, [`ErrorKind::NotInsideCoroutine`] outside a
    /// coroutine.
    pub fn await_send(&self, element: T) -> Result<()> {
        self.inner.await_send(element)
    }

    /// Non-suspending send: true iff the element was accepted (buffer
    /// space or a waiting receiver).
    pub fn offer(&self, element: T) -> bool {
        self.inner.offer(element)
    }

    /// Forwards a future's success value into the channel (offer
    /// semantics); failures and terminal channels drop the value.
    pub fn send_future(&self, future: &CoFuture<T>)
    where
        T: Clone,
    {
        let inner = Arc::clone(&self.inner);
        future.when_complete(move |result| match result {
            Ok(value) => {
                if !inner.offer(value.clone()) {
                    tracing::debug!("send_future: channel rejected value; dropping");
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, "send_future: source failed; dropping");
            }
        });
    }

    /// Receives inside a coroutine, suspending while the buffer is empty.
    ///
    /// A closed channel keeps delivering buffered elements and fails with
    /// [`ErrorKind::ChannelClosed`] once drained; a cancelled channel fails
    /// immediately.
    pub fn await_receive(&self) -> Result<T> {
        self.inner.await_receive()
    }

    /// Non-suspending receive: a buffered element or `None`.
    pub fn poll(&self) -> Option<T> {
        self.inner.poll()
    }

    /// Registers a one-shot receive callback, fired with the next element
    /// or the terminal error.
    pub fn when_receive<F>(&self, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.inner.when_receive(Box::new(callback));
    }

    /// Closes the channel: buffered elements stay deliverable, waiters
    /// fail with [`ErrorKind::ChannelClosed`]. True on the first close only.
    pub fn close(&self) -> bool {
        self.inner.close()
    }

    /// Cancels the channel: buffered elements are dropped, waiters fail
    /// with [`ErrorKind::ChannelCancelled`]. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// True once the channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.mode() == MODE_CLOSED
    }

    /// True once the channel is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.mode() == MODE_CANCELLED
    }

    /// Number of buffered elements.
    #[must_use]
    pub fn buffered(&self) -> usize {
        usize::try_from(self.inner.count().max(0)).unwrap_or(0)
    }

    /// Registers a callback fired once the channel reaches a terminal
    /// state with a drained buffer.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.when_complete_inner(Box::new(callback));
    }

    /// Registers a callback fired on completion only if the channel was
    /// cancelled.
    pub fn when_cancelled<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.when_complete_inner(Box::new(move || {
            if inner.mode() == MODE_CANCELLED {
                callback();
            }
        }));
    }

    /// Derives a receiver that transforms every delivered element. The
    /// underlying channel's lifecycle is shared, not owned.
    #[must_use]
    pub fn map<U, F>(&self, transform: F) -> MapReceiver<T, U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        MapReceiver::new(Arc::clone(&self.inner), Arc::new(transform))
    }

    /// An iterator that awaits inside a coroutine and polls outside.
    ///
    /// Ends when the channel is terminal and the buffer is drained (or,
    /// outside a coroutine, as soon as the buffer is empty).
    #[must_use]
    pub fn iter(&self) -> ChannelIter<T> {
        ChannelIter::new(Arc::clone(&self.inner))
    }
}

impl<T: Send + 'static> IntoIterator for &CoChannel<T> {
    type Item = T;
    type IntoIter = ChannelIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
