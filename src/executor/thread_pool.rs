//! Any-thread executor backed by a pool of worker threads.
//!
//! Threads are spawned lazily up to `max_threads`. When idle beyond a
//! threshold, threads above `min_threads` are retired. This balances
//! responsiveness with resource efficiency. Submission order is preserved by
//! the FIFO work queue, but thunks may run on any worker.

use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use super::{CoroutineExecutor, Thunk};
use crate::config::RuntimeConfig;

/// Default idle timeout before retiring excess threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// An any-thread executor over a dynamically-sized worker pool.
pub struct ThreadPoolExecutor {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Minimum number of threads to keep alive.
    min_threads: usize,
    /// Maximum number of threads allowed.
    max_threads: usize,
    /// Current number of live threads.
    active_threads: AtomicUsize,
    /// Number of threads currently executing work.
    busy_threads: AtomicUsize,
    /// Number of pending thunks in the queue.
    pending_count: AtomicUsize,
    /// Monotonic counter for thread names.
    next_thread_id: AtomicU64,
    /// Work queue.
    queue: SegQueue<Thunk>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Mutex for the condition variable.
    mutex: Mutex<()>,
    /// Idle timeout for excess threads.
    idle_timeout: Duration,
    /// Thread name prefix.
    thread_name_prefix: String,
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field(
                "pending_count",
                &self.inner.pending_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl ThreadPoolExecutor {
    /// Creates a pool with the given thread limits.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize) -> Arc<Self> {
        Self::with_options(min_threads, max_threads, "cofiber-worker".to_string())
    }

    /// Creates a pool from a [`RuntimeConfig`].
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Arc<Self> {
        Self::with_options(
            config.min_threads,
            config.max_threads,
            config.thread_name_prefix.clone(),
        )
    }

    fn with_options(min_threads: usize, max_threads: usize, prefix: String) -> Arc<Self> {
        assert!(max_threads > 0, "max_threads must be at least 1");
        let max_threads = max_threads.max(min_threads);

        let pool = Arc::new(Self {
            inner: Arc::new(PoolInner {
                min_threads,
                max_threads,
                active_threads: AtomicUsize::new(0),
                busy_threads: AtomicUsize::new(0),
                pending_count: AtomicUsize::new(0),
                next_thread_id: AtomicU64::new(1),
                queue: SegQueue::new(),
                shutdown: AtomicBool::new(false),
                condvar: Condvar::new(),
                mutex: Mutex::new(()),
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                thread_name_prefix: prefix,
            }),
        });

        for _ in 0..min_threads {
            pool.inner.spawn_thread();
        }
        pool
    }

    /// Returns the process-global pool, built from [`RuntimeConfig::from_env`].
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<ThreadPoolExecutor>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid COFIBER_* environment; using defaults");
                RuntimeConfig::default()
            });
            Self::from_config(&config)
        })
    }

    /// Returns the number of pending thunks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Stops accepting work and wakes all workers so they can exit.
    ///
    /// Queued thunks that have not started are dropped. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify_all();
    }
}

impl CoroutineExecutor for ThreadPoolExecutor {
    fn submit(&self, thunk: Thunk) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            tracing::debug!("thread pool shut down; dropping submitted thunk");
            return;
        }
        self.inner.queue.push(thunk);
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        self.inner.maybe_spawn_thread();
        self.inner.notify_one();
    }
}

impl PoolInner {
    fn notify_one(&self) {
        let _guard = self.mutex.lock().expect("pool lock poisoned");
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock().expect("pool lock poisoned");
        self.condvar.notify_all();
    }

    /// Spawns an extra worker while queued work exceeds the idle workers
    /// available to absorb it.
    fn maybe_spawn_thread(self: &Arc<Self>) {
        loop {
            let active = self.active_threads.load(Ordering::Acquire);
            if active >= self.max_threads {
                return;
            }
            let busy = self.busy_threads.load(Ordering::Acquire);
            let idle = active.saturating_sub(busy);
            if self.pending_count.load(Ordering::Acquire) <= idle {
                return;
            }
            if self
                .active_threads
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_thread_slot_claimed();
                return;
            }
        }
    }

    fn spawn_thread(self: &Arc<Self>) {
        self.active_threads.fetch_add(1, Ordering::AcqRel);
        self.spawn_thread_slot_claimed();
    }

    fn spawn_thread_slot_claimed(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{id}", self.thread_name_prefix);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.worker_loop());
        if let Err(err) = spawned {
            self.active_threads.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(error = %err, thread = %name, "failed to spawn worker thread");
        }
    }

    fn worker_loop(self: Arc<Self>) {
        tracing::trace!(thread = ?thread::current().name(), "worker started");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some(thunk) = self.queue.pop() {
                self.pending_count.fetch_sub(1, Ordering::Relaxed);
                self.busy_threads.fetch_add(1, Ordering::AcqRel);
                thunk();
                self.busy_threads.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            // Park until notified or until the idle timeout elapses.
            let guard = self.mutex.lock().expect("pool lock poisoned");
            if !self.queue.is_empty() || self.shutdown.load(Ordering::Acquire) {
                continue;
            }
            let (guard, timeout) = self
                .condvar
                .wait_timeout(guard, self.idle_timeout)
                .expect("pool lock poisoned");
            drop(guard);

            if timeout.timed_out() && self.queue.is_empty() {
                // Retire if we are above the minimum.
                let active = self.active_threads.load(Ordering::Acquire);
                if active > self.min_threads
                    && self
                        .active_threads
                        .compare_exchange(active, active - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    tracing::trace!(thread = ?thread::current().name(), "idle worker retired");
                    return;
                }
            }
        }
        self.active_threads.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(thread = ?thread::current().name(), "worker stopped");
    }
}
