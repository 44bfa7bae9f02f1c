//! Strict submission-order execution layered over any executor.
//!
//! A serial executor never runs two thunks concurrently and preserves
//! submission order, while borrowing threads from the executor underneath.
//! It is the ordering building block: coroutines resumed through the same
//! serial executor interleave strictly by resume order.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{CoroutineExecutor, Thunk};

/// A strict-FIFO, one-at-a-time executor over an underlying executor.
pub struct SerialExecutor {
    inner: Arc<SerialInner>,
}

struct SerialInner {
    target: Arc<dyn CoroutineExecutor>,
    queue: SegQueue<Thunk>,
    /// True while a drain pass is scheduled or running.
    scheduled: AtomicBool,
}

impl SerialExecutor {
    /// Creates a serial executor that borrows threads from `target`.
    #[must_use]
    pub fn new(target: Arc<dyn CoroutineExecutor>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SerialInner {
                target,
                queue: SegQueue::new(),
                scheduled: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the number of queued thunks not yet started.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

impl CoroutineExecutor for SerialExecutor {
    fn submit(&self, thunk: Thunk) {
        self.inner.queue.push(thunk);
        self.inner.schedule_drain();
    }
}

impl SerialInner {
    fn schedule_drain(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        self.target.submit(Box::new(move || inner.drain()));
    }

    /// Runs queued thunks in order until the queue goes quiet.
    ///
    /// The single-drainer invariant comes from `scheduled`: only the thread
    /// that flips it false→true submits a drain pass.
    fn drain(self: &Arc<Self>) {
        loop {
            while let Some(thunk) = self.queue.pop() {
                thunk();
            }
            self.scheduled.store(false, Ordering::Release);
            // A submitter may have pushed between the last pop and the store
            // above and lost the swap race; reclaim the drain if so.
            if self.queue.is_empty() {
                return;
            }
            if self.scheduled.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}
