//! Deadline-driven thunk submission.
//!
//! A single process-global timer thread keeps a min-heap of
//! `(deadline, generation)` entries and, when a deadline passes, submits the
//! entry's thunk to its target executor. Awaits with a timeout schedule
//! their timeout attempt here; racing with normal completion is benign
//! because resolution is single-assignment.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use super::{CoroutineExecutor, Thunk};

struct TimerEntry {
    deadline: Instant,
    generation: u64,
    target: Arc<dyn CoroutineExecutor>,
    thunk: Thunk,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TimerShared {
    heap: Mutex<TimerHeap>,
    condvar: Condvar,
}

struct TimerHeap {
    entries: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

fn shared() -> &'static Arc<TimerShared> {
    static SHARED: OnceLock<Arc<TimerShared>> = OnceLock::new();
    SHARED.get_or_init(|| {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(TimerHeap {
                entries: BinaryHeap::new(),
                next_generation: 0,
            }),
            condvar: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        // The timer is a process-global singleton created inside
        // `get_or_init`, which cannot propagate an error to its caller;
        // without this thread every timed await would park forever, so a
        // spawn failure here must be loud, not degraded.
        thread::Builder::new()
            .name("cofiber-timer".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn timer thread");
        shared
    })
}

/// Schedules `thunk` to be submitted to `target` after `delay`.
pub fn submit_after(target: Arc<dyn CoroutineExecutor>, delay: Duration, thunk: Thunk) {
    submit_at(target, Instant::now() + delay, thunk);
}

/// Schedules `thunk` to be submitted to `target` at `deadline`.
pub fn submit_at(target: Arc<dyn CoroutineExecutor>, deadline: Instant, thunk: Thunk) {
    let shared = shared();
    {
        let mut heap = shared.heap.lock();
        let generation = heap.next_generation;
        heap.next_generation += 1;
        heap.entries.push(TimerEntry {
            deadline,
            generation,
            target,
            thunk,
        });
    }
    shared.condvar.notify_one();
}

impl TimerShared {
    fn run(self: Arc<Self>) {
        let mut heap = self.heap.lock();
        loop {
            let now = Instant::now();
            // Fire everything due, outside the lock.
            let mut due = Vec::new();
            while heap
                .entries
                .peek()
                .is_some_and(|entry| entry.deadline <= now)
            {
                if let Some(entry) = heap.entries.pop() {
                    due.push(entry);
                }
            }
            if !due.is_empty() {
                drop(heap);
                for entry in due {
                    entry.target.submit(entry.thunk);
                }
                heap = self.heap.lock();
                continue;
            }

            match heap.entries.peek().map(|entry| entry.deadline) {
                Some(deadline) => {
                    self.condvar.wait_until(&mut heap, deadline);
                }
                None => self.condvar.wait(&mut heap),
            }
        }
    }
}
