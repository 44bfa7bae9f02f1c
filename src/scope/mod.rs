//! Cancellation scopes: structured teardown for futures, channels, and
//! child scopes.
//!
//! A [`CoScope`] owns a set of [`Cancellable`]s. Cancelling the scope (or
//! dropping it) cancels every member exactly once; members added after the
//! scope is cancelled are cancelled immediately. Members that complete
//! naturally remove themselves, so long-lived scopes do not grow without
//! bound.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::channel::CoChannel;
use crate::future::{CoFuture, CoPromise};
use crate::util::callback_stack::CallbackStack;

/// An entity that can be cancelled and reports its completion.
pub trait Cancellable: Send + Sync {
    /// Requests cancellation. Idempotent; a no-op once complete.
    fn cancel(&self);

    /// Registers a callback fired exactly once on completion — natural,
    /// cancelled, or at destruction.
    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>);
}

impl<T: Send + 'static> Cancellable for CoFuture<T> {
    fn cancel(&self) {
        CoFuture::cancel(self);
    }

    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
        self.when_complete(move |_| callback());
    }
}

impl<T: Send + 'static> Cancellable for CoPromise<T> {
    fn cancel(&self) {
        CoPromise::cancel(self);
    }

    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
        self.future().when_complete(move |_| callback());
    }
}

impl<T: Send + 'static> Cancellable for CoChannel<T> {
    fn cancel(&self) {
        CoChannel::cancel(self);
    }

    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
        self.when_complete(callback);
    }
}

/// Scope accepting new members.
const OPEN: u8 = 0;
/// Scope cancelled; additions are cancelled on arrival.
const CANCELLED: u8 = 1;

struct ScopeInner {
    /// State and membership share one lock: an `add` that observes `open`
    /// under the lock is guaranteed to be seen by the cancel drain, so no
    /// member misses its cancellation.
    members: Mutex<ScopeMembers>,
    completion: CallbackStack<()>,
    next_key: AtomicU64,
}

struct ScopeMembers {
    state: u8,
    items: HashMap<u64, Box<dyn Cancellable>>,
    /// Keys whose completion callback ran before the member was stored
    /// (a member can complete inline during `add`, before insertion).
    pending_removals: HashSet<u64>,
}

/// A cancellation-propagating collection of cancellables.
///
/// Dropping the scope is equivalent to [`CoScope::cancel`].
pub struct CoScope {
    inner: Arc<ScopeInner>,
}

impl Default for CoScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CoScope {
    /// Creates an open scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                members: Mutex::new(ScopeMembers {
                    state: OPEN,
                    items: HashMap::new(),
                    pending_removals: HashSet::new(),
                }),
                completion: CallbackStack::new(),
                next_key: AtomicU64::new(0),
            }),
        }
    }

    /// Adds a member. If the scope is already cancelled the member is
    /// cancelled immediately and not stored; otherwise it is held until it
    /// completes or the scope cancels it.
    pub fn add<C: Cancellable + 'static>(&self, member: C) {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let boxed: Box<dyn Cancellable> = Box::new(member);
        // Self-removal on natural completion keeps the set small. Register
        // before taking the lock: the callback may fire inline for an
        // already-complete member, and it takes the lock itself.
        let weak = Arc::downgrade(&self.inner);
        boxed.on_complete(Box::new(move || {
            Self::remove(&weak, key);
        }));
        {
            let mut members = self.inner.members.lock();
            if members.state == OPEN {
                if !members.pending_removals.remove(&key) {
                    members.items.insert(key, boxed);
                }
                return;
            }
        }
        tracing::trace!("member added to a cancelled scope; cancelling it now");
        boxed.cancel();
    }

    fn remove(inner: &Weak<ScopeInner>, key: u64) {
        if let Some(inner) = inner.upgrade() {
            let mut members = inner.members.lock();
            if members.items.remove(&key).is_none() && members.state == OPEN {
                // The member completed before its `add` stored it; the
                // in-flight `add` consumes this tombstone instead.
                members.pending_removals.insert(key);
            }
        }
    }

    /// Cancels every member exactly once, then fires completion callbacks.
    /// Idempotent.
    pub fn cancel(&self) {
        let drained = {
            let mut members = self.inner.members.lock();
            if members.state == CANCELLED {
                return;
            }
            members.state = CANCELLED;
            std::mem::take(&mut members.items)
        };
        tracing::debug!(members = drained.len(), "scope cancelled");
        for member in drained.into_values() {
            member.cancel();
        }
        self.inner.completion.close(&());
    }

    /// True once the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.members.lock().state == CANCELLED
    }

    /// Number of live members (completed members remove themselves).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.members.lock().items.len()
    }

    /// True when no members are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a callback fired exactly once after the scope's members
    /// have been cancelled (or immediately, if that already happened).
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(callback) = self.inner.completion.push(Box::new(move |()| callback())) {
            callback(&());
        }
    }
}

impl Cancellable for CoScope {
    fn cancel(&self) {
        CoScope::cancel(self);
    }

    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
        self.when_complete(move || callback());
    }
}

impl Drop for CoScope {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for CoScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = self.inner.members.lock();
        f.debug_struct("CoScope")
            .field("cancelled", &(members.state == CANCELLED))
            .field("members", &members.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    /// Counts cancellations and detects double cancels.
    struct CountingCancellable {
        cancelled: std::sync::atomic::AtomicBool,
        cancels: Arc<AtomicUsize>,
        double_cancels: Arc<AtomicUsize>,
        completion: Arc<CallbackStack<()>>,
    }

    impl CountingCancellable {
        fn new(cancels: Arc<AtomicUsize>, double_cancels: Arc<AtomicUsize>) -> Self {
            Self {
                cancelled: std::sync::atomic::AtomicBool::new(false),
                cancels,
                double_cancels,
                completion: Arc::new(CallbackStack::new()),
            }
        }
    }

    impl Cancellable for CountingCancellable {
        fn cancel(&self) {
            if self.cancelled.swap(true, Ordering::SeqCst) {
                self.double_cancels.fetch_add(1, Ordering::SeqCst);
            } else {
                self.cancels.fetch_add(1, Ordering::SeqCst);
            }
            self.completion.close(&());
        }

        fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
            if let Err(callback) = self.completion.push(Box::new(move |()| callback())) {
                callback(&());
            }
        }
    }

    #[test]
    fn cancel_reaches_every_member_once() {
        init_test("cancel_reaches_every_member_once");
        let scope = CoScope::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let doubles = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            scope.add(CountingCancellable::new(Arc::clone(&cancels), Arc::clone(&doubles)));
        }
        scope.cancel();
        crate::assert_with_log!(cancels.load(Ordering::SeqCst) == 10, "all cancelled", 10, cancels.load(Ordering::SeqCst));
        scope.cancel();
        crate::assert_with_log!(cancels.load(Ordering::SeqCst) == 10, "idempotent", 10, cancels.load(Ordering::SeqCst));
        crate::assert_with_log!(doubles.load(Ordering::SeqCst) == 0, "no double cancels", 0, doubles.load(Ordering::SeqCst));
        crate::test_complete!("cancel_reaches_every_member_once");
    }

    #[test]
    fn add_after_cancel_cancels_immediately() {
        init_test("add_after_cancel_cancels_immediately");
        let scope = CoScope::new();
        scope.cancel();
        let cancels = Arc::new(AtomicUsize::new(0));
        let doubles = Arc::new(AtomicUsize::new(0));
        scope.add(CountingCancellable::new(Arc::clone(&cancels), Arc::clone(&doubles)));
        crate::assert_with_log!(cancels.load(Ordering::SeqCst) == 1, "cancelled on add", 1, cancels.load(Ordering::SeqCst));
        crate::assert_with_log!(scope.is_empty(), "not stored", true, scope.is_empty());
        crate::test_complete!("add_after_cancel_cancels_immediately");
    }

    #[test]
    fn drop_cancels_members() {
        init_test("drop_cancels_members");
        let cancels = Arc::new(AtomicUsize::new(0));
        let doubles = Arc::new(AtomicUsize::new(0));
        {
            let scope = CoScope::new();
            scope.add(CountingCancellable::new(Arc::clone(&cancels), Arc::clone(&doubles)));
            scope.add(CountingCancellable::new(Arc::clone(&cancels), Arc::clone(&doubles)));
        }
        crate::assert_with_log!(cancels.load(Ordering::SeqCst) == 2, "cancelled at drop", 2, cancels.load(Ordering::SeqCst));
        crate::test_complete!("drop_cancels_members");
    }

    #[test]
    fn futures_added_to_a_scope_get_cancelled() {
        init_test("futures_added_to_a_scope_get_cancelled");
        let promise = CoPromise::<i32>::new();
        let future = promise.future();
        let scope = CoScope::new();
        scope.add(future.clone());
        scope.cancel();
        assert!(future.is_cancelled());
        let err = future.try_result().expect("resolved").expect_err("cancelled");
        crate::assert_with_log!(err.kind() == ErrorKind::Cancelled, "kind", ErrorKind::Cancelled, err.kind());
        crate::test_complete!("futures_added_to_a_scope_get_cancelled");
    }

    #[test]
    fn channels_added_to_a_scope_get_cancelled() {
        init_test("channels_added_to_a_scope_get_cancelled");
        let channel = CoChannel::<i32>::new(2);
        channel.offer(1);
        let scope = CoScope::new();
        scope.add(channel.clone());
        scope.cancel();
        crate::assert_with_log!(channel.is_cancelled(), "channel cancelled", true, channel.is_cancelled());
        crate::test_complete!("channels_added_to_a_scope_get_cancelled");
    }

    #[test]
    fn completed_members_remove_themselves() {
        init_test("completed_members_remove_themselves");
        let scope = CoScope::new();
        let promise = CoPromise::<i32>::new();
        scope.add(promise.future());
        crate::assert_with_log!(scope.len() == 1, "stored", 1, scope.len());
        promise.success(1);
        crate::assert_with_log!(scope.is_empty(), "removed on completion", true, scope.is_empty());
        crate::test_complete!("completed_members_remove_themselves");
    }

    #[test]
    fn child_scope_cancels_with_parent() {
        init_test("child_scope_cancels_with_parent");
        let parent = CoScope::new();
        let child = CoScope::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let doubles = Arc::new(AtomicUsize::new(0));
        child.add(CountingCancellable::new(Arc::clone(&cancels), Arc::clone(&doubles)));
        parent.add(CoScope {
            inner: Arc::clone(&child.inner),
        });
        parent.cancel();
        crate::assert_with_log!(cancels.load(Ordering::SeqCst) == 1, "grandchild cancelled", 1, cancels.load(Ordering::SeqCst));
        crate::assert_with_log!(child.is_cancelled(), "child cancelled", true, child.is_cancelled());
        crate::test_complete!("child_scope_cancels_with_parent");
    }

    #[test]
    fn concurrent_add_and_cancel_lose_nothing() {
        init_test("concurrent_add_and_cancel_lose_nothing");
        for _ in 0..20 {
            let scope = Arc::new(CoScope::new());
            let cancels = Arc::new(AtomicUsize::new(0));
            let doubles = Arc::new(AtomicUsize::new(0));
            let added = Arc::new(AtomicUsize::new(0));
            let adders: Vec<_> = (0..4)
                .map(|_| {
                    let scope = Arc::clone(&scope);
                    let cancels = Arc::clone(&cancels);
                    let doubles = Arc::clone(&doubles);
                    let added = Arc::clone(&added);
                    std::thread::spawn(move || {
                        for _ in 0..250 {
                            scope.add(CountingCancellable::new(
                                Arc::clone(&cancels),
                                Arc::clone(&doubles),
                            ));
                            added.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            let canceller = {
                let scope = Arc::clone(&scope);
                std::thread::spawn(move || {
                    scope.cancel();
                })
            };
            for t in adders {
                t.join().unwrap();
            }
            canceller.join().unwrap();
            // Members still held (added before the cancel drain ran but
            // after the drain completed cannot exist: adds after cancel
            // are cancelled inline).
            crate::assert_with_log!(
                cancels.load(Ordering::SeqCst) == added.load(Ordering::SeqCst),
                "every member cancelled exactly once",
                added.load(Ordering::SeqCst),
                cancels.load(Ordering::SeqCst)
            );
            crate::assert_with_log!(
                doubles.load(Ordering::SeqCst) == 0,
                "no double cancels",
                0,
                doubles.load(Ordering::SeqCst)
            );
        }
        crate::test_complete!("concurrent_add_and_cancel_lose_nothing");
    }
}
