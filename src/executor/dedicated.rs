//! A specific-thread executor: every thunk runs on one designated thread.
//!
//! This fills the "main thread" role in environments without a UI event
//! loop: coroutines switched to a dedicated executor are guaranteed to
//! resume on its thread.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use super::{CoroutineExecutor, Thunk};
use crate::error::{Error, ErrorKind};

/// An executor owning a single worker thread.
pub struct DedicatedThreadExecutor {
    shared: Arc<DedicatedShared>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct DedicatedShared {
    queue: Mutex<VecDeque<Thunk>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl DedicatedThreadExecutor {
    /// Spawns the worker thread and returns the executor.
    ///
    /// # Errors
    ///
    /// Fails when the OS refuses to spawn the worker thread.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>, Error> {
        let shared = Arc::new(DedicatedShared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker.run())
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_context("failed to spawn dedicated executor thread")
                    .with_source(err)
            })?;
        let thread_id = handle.thread().id();
        Ok(Arc::new(Self {
            shared,
            thread_id,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Returns the id of the worker thread.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns true when called from the worker thread itself.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stops the worker after it drains already-queued thunks, and joins it.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl CoroutineExecutor for DedicatedThreadExecutor {
    fn submit(&self, thunk: Thunk) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            tracing::debug!("dedicated executor shut down; dropping submitted thunk");
            return;
        }
        self.shared.queue.lock().push_back(thunk);
        self.shared.condvar.notify_one();
    }
}

impl Drop for DedicatedThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DedicatedShared {
    fn run(self: Arc<Self>) {
        loop {
            let thunk = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(thunk) = queue.pop_front() {
                        break Some(thunk);
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    self.condvar.wait(&mut queue);
                }
            };
            match thunk {
                Some(thunk) => thunk(),
                None => return,
            }
        }
    }
}
