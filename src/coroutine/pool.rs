//! The shared coroutine stack pool.
//!
//! Acquisition pops a free stack, or allocates while the pool is under
//! capacity. At capacity, a suspended coroutine is asked to donate: its live
//! frames spill to a heap buffer and its stack is handed to the acquirer.
//! Release pushes the stack back, or unmaps it when the free list is full.

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use super::core::CoroutineCore;
use super::stack::CoroStack;
use crate::config::RuntimeConfig;
use crate::error::Result;

/// A bounded pool of reusable coroutine stacks.
pub(crate) struct StackPool {
    /// Free stacks ready for reuse.
    free: ArrayQueue<CoroStack>,
    /// Total stacks currently alive (free + lent out).
    allocated: AtomicUsize,
    /// Allocation gate: above this, acquisition prefers spilling a donor.
    capacity: usize,
    /// Usable stack size for new allocations.
    stack_size: usize,
    /// Suspended coroutines that may donate their stack.
    donors: Mutex<VecDeque<Weak<CoroutineCore>>>,
}

impl StackPool {
    pub(crate) fn new(capacity: usize, stack_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            allocated: AtomicUsize::new(0),
            capacity: capacity.max(1),
            stack_size,
            donors: Mutex::new(VecDeque::new()),
        }
    }

    /// The process-global pool, sized by [`RuntimeConfig::from_env`].
    pub(crate) fn global() -> &'static Arc<StackPool> {
        static GLOBAL: OnceLock<Arc<StackPool>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid COFIBER_* environment; using defaults");
                RuntimeConfig::default()
            });
            Arc::new(Self::new(config.stack_pool_capacity, config.stack_size))
        })
    }

    /// Acquires a stack: free list, then fresh allocation under the capacity
    /// gate, then donor spill, then (as a last resort) over-allocation.
    pub(crate) fn acquire(&self) -> Result<CoroStack> {
        if let Some(stack) = self.free.pop() {
            return Ok(stack);
        }
        if self.try_claim_allocation_slot() {
            return self.allocate();
        }
        if let Some(stack) = self.reclaim_from_donor() {
            tracing::debug!(base = stack.base_addr(), "reusing donated stack");
            return Ok(stack);
        }
        tracing::debug!(capacity = self.capacity, "stack pool exhausted; over-allocating");
        self.allocated.fetch_add(1, Ordering::AcqRel);
        self.allocate_unchecked()
    }

    /// Acquires a stack, preferring the region whose base is `preferred` so
    /// a spilled coroutine restores at its original addresses.
    pub(crate) fn acquire_preferring(&self, preferred: usize) -> Result<CoroStack> {
        let mut passed_over = Vec::new();
        let mut found = None;
        while let Some(stack) = self.free.pop() {
            if stack.base_addr() == preferred {
                found = Some(stack);
                break;
            }
            passed_over.push(stack);
        }
        for stack in passed_over {
            if self.free.push(stack).is_err() {
                self.allocated.fetch_sub(1, Ordering::AcqRel);
            }
        }
        match found {
            Some(stack) => Ok(stack),
            None => self.acquire(),
        }
    }

    /// Returns a stack to the pool, unmapping it when the free list is full.
    pub(crate) fn release(&self, stack: CoroStack) {
        if self.free.push(stack).is_err() {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Registers a suspended coroutine as a potential stack donor.
    pub(crate) fn register_donor(&self, coroutine: Weak<CoroutineCore>) {
        self.donors.lock().push_back(coroutine);
    }

    fn try_claim_allocation_slot(&self) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn allocate(&self) -> Result<CoroStack> {
        let stack = self.allocate_unchecked();
        if stack.is_err() {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
        stack
    }

    fn allocate_unchecked(&self) -> Result<CoroStack> {
        CoroStack::new(self.stack_size)
    }

    /// Asks suspended coroutines, oldest first, to donate their stack.
    fn reclaim_from_donor(&self) -> Option<CoroStack> {
        loop {
            let candidate = self.donors.lock().pop_front()?;
            let Some(coroutine) = candidate.upgrade() else {
                continue;
            };
            if let Some(stack) = coroutine.try_spill() {
                return Some(stack);
            }
            // Not suspended anymore (or already spilled); skip it.
        }
    }

    /// Number of stacks currently alive, for diagnostics and tests.
    #[cfg(test)]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}
