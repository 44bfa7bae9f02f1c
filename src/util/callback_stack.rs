//! A lock-free callback stack that closes exactly once.
//!
//! Futures, channels, and scopes all share the same completion-callback
//! discipline: callbacks registered before the terminal transition are fired
//! by whoever performs the transition; callbacks registered after it are
//! handed back to the registrant to fire inline. No callback fires twice,
//! and the drain happens exactly once.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A one-shot completion callback taking the terminal value by reference.
pub(crate) type Callback<A> = Box<dyn FnOnce(&A) + Send>;

struct Node<A> {
    callback: Callback<A>,
    next: *mut Node<A>,
}

/// Lock-free stack of one-shot callbacks with an atomically-installed
/// "closed" sentinel.
pub(crate) struct CallbackStack<A> {
    head: AtomicPtr<Node<A>>,
}

// The sentinel is never dereferenced; any non-null, never-allocated address
// works. Alignment of 1 is irrelevant for an opaque marker.
fn closed_sentinel<A>() -> *mut Node<A> {
    ptr::without_provenance_mut::<Node<A>>(1)
}

impl<A> CallbackStack<A> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns true once the stack has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == closed_sentinel::<A>()
    }

    /// Pushes a callback, or hands it back if the stack is already closed.
    ///
    /// The caller must fire a returned callback inline with the terminal
    /// value to preserve the exactly-once guarantee.
    pub(crate) fn push(&self, callback: Callback<A>) -> Result<(), Callback<A>> {
        let node = Box::into_raw(Box::new(Node {
            callback,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == closed_sentinel::<A>() {
                // SAFETY: `node` was just allocated by `Box::into_raw` above
                // and has not been shared; reclaiming it is exclusive.
                let node = unsafe { Box::from_raw(node) };
                return Err(node.callback);
            }
            // SAFETY: `node` is exclusively ours until the CAS below
            // publishes it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => head = actual,
            }
        }
    }

    /// Closes the stack and fires every registered callback with `value`.
    ///
    /// Returns true if this call performed the close; false if the stack was
    /// already closed (in which case nothing fires).
    pub(crate) fn close(&self, value: &A) -> bool {
        let mut current = self.head.swap(closed_sentinel::<A>(), Ordering::AcqRel);
        if current == closed_sentinel::<A>() {
            return false;
        }
        while !current.is_null() {
            // SAFETY: the swap above transferred exclusive ownership of the
            // whole list to this call; each node was created by Box::into_raw.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
            (node.callback)(value);
        }
        true
    }
}

impl<A> Drop for CallbackStack<A> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        if current == closed_sentinel::<A>() {
            return;
        }
        while !current.is_null() {
            // SAFETY: `&mut self` gives exclusive ownership of the list.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
            // Callbacks are dropped, not fired; owners resolve with a
            // terminal error before dropping the stack.
        }
    }
}

// SAFETY: the stack only stores `Send` callbacks, and all shared mutation
// goes through atomic operations on `head`.
unsafe impl<A: Send> Send for CallbackStack<A> {}
// SAFETY: see above; `close` takes ownership of the list via a single swap,
// so concurrent closers cannot observe the same node.
unsafe impl<A: Send> Sync for CallbackStack<A> {}
