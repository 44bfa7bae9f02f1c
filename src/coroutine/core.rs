//! The coroutine state machine and suspend/resume protocol.
//!
//! A coroutine moves through
//!
//! ```text
//! prepared ──start──▶ running ──await──▶ suspending ──switch──▶ suspended
//! suspended ──resume──▶ restarting ──switch──▶ running
//! running ──return──▶ done (stack released)
//! ```
//!
//! Only `running` and `restarting` execute on the coroutine stack. Exactly
//! one thread drives a given coroutine at a time: entry goes through
//! [`CoroutineCore::enter`], which the executor thunk and the resume path
//! never call concurrently (the state CAS decides a single winner).
//!
//! The await cell is the one-shot rendezvous between the suspending
//! coroutine and its resume callback. A resume that lands while the
//! coroutine is still between "armed" and the actual switch is absorbed
//! without a context switch (the documented fast path) or by re-entering on
//! the suspending thread (the suspending→restarting race).

use parking_lot::Mutex;
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use super::context::{self, MachineContext};
use super::pool::StackPool;
use super::stack::CoroStack;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::CoroutineExecutor;

/// Coroutine has been created but never entered.
pub(crate) const PREPARED: u8 = 0;
/// Coroutine code is executing on its stack.
pub(crate) const RUNNING: u8 = 1;
/// Coroutine committed to suspension but has not switched out yet.
pub(crate) const SUSPENDING: u8 = 2;
/// Coroutine is off-CPU, waiting for its resume callback.
pub(crate) const SUSPENDED: u8 = 3;
/// A resume won the race; the coroutine is about to run again.
pub(crate) const RESTARTING: u8 = 4;
/// Coroutine body returned; the stack has been (or is being) released.
pub(crate) const DONE: u8 = 5;

/// Await cell: callback installed, not yet fired.
const CELL_ARMED: u8 = 1;
/// Await cell: the one-shot winner is writing the value.
const CELL_FIRING: u8 = 2;
/// Await cell: value available.
const CELL_FIRED: u8 = 3;

enum StackSlot {
    /// No stack attached (before first entry, or after completion).
    Empty,
    /// The coroutine owns this stack.
    Attached(CoroStack),
    /// The stack was donated; live frames are parked on the heap.
    Spilled(SpillBuffer),
}

/// Live frames of a suspended coroutine, copied off a donated stack.
struct SpillBuffer {
    /// Bytes of `[sp, top)` at spill time.
    frames: Vec<u8>,
    /// Aligned top address of the original stack.
    old_top: usize,
    /// Original region identity, preferred on restore.
    old_base: usize,
}

/// Shared state of one coroutine.
pub(crate) struct CoroutineCore {
    state: AtomicU8,
    /// Set by `switch_to`: after parking, immediately resubmit.
    reschedule: AtomicBool,
    stack: Mutex<StackSlot>,
    /// Saved coroutine-side context (valid while not running).
    coro_ctx: UnsafeCell<MachineContext>,
    /// Saved host-side context (valid while the coroutine runs).
    host_ctx: UnsafeCell<MachineContext>,
    /// The body, taken exactly once at first entry.
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Where resume thunks are submitted.
    submitter: Mutex<Arc<dyn CoroutineExecutor>>,
    pool: Arc<StackPool>,
}

// SAFETY: the machine contexts behind `UnsafeCell` are only touched by the
// single thread currently driving the coroutine; the state machine plus the
// stack-slot lock enforce that exclusivity. Everything else is atomics,
// locks, or `Send` data.
unsafe impl Send for CoroutineCore {}
// SAFETY: see above.
unsafe impl Sync for CoroutineCore {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<CoroutineCore>>> = const { RefCell::new(None) };
}

/// Returns the coroutine currently running on this thread, if any.
pub(crate) fn current() -> Option<Arc<CoroutineCore>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// True when called from inside a coroutine.
pub(crate) fn is_inside() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}

impl CoroutineCore {
    pub(crate) fn new(
        body: Box<dyn FnOnce() + Send>,
        submitter: Arc<dyn CoroutineExecutor>,
        pool: Arc<StackPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PREPARED),
            reschedule: AtomicBool::new(false),
            stack: Mutex::new(StackSlot::Empty),
            coro_ctx: UnsafeCell::new(MachineContext::null()),
            host_ctx: UnsafeCell::new(MachineContext::null()),
            body: Mutex::new(Some(body)),
            submitter: Mutex::new(submitter),
            pool,
        })
    }

    /// Replaces the resume submitter (used by `switch_to`).
    pub(crate) fn set_submitter(&self, submitter: Arc<dyn CoroutineExecutor>) {
        *self.submitter.lock() = submitter;
    }

    /// Returns the current resume submitter.
    pub(crate) fn submitter(&self) -> Arc<dyn CoroutineExecutor> {
        self.submitter.lock().clone()
    }

    /// Requests a park-then-resubmit after the next suspension commits.
    pub(crate) fn request_reschedule(&self) {
        self.reschedule.store(true, Ordering::SeqCst);
    }

    /// Drives the coroutine on the calling thread until it suspends or
    /// completes. The single entry point onto the coroutine stack.
    pub(crate) fn enter(self: &Arc<Self>) {
        loop {
            if let Err(err) = self.prepare_stack() {
                tracing::error!(error = %err, "failed to prepare coroutine stack");
                // Dropping the body resolves any wrapping promise as broken.
                *self.body.lock() = None;
                self.state.store(DONE, Ordering::SeqCst);
                return;
            }
            self.state.store(RUNNING, Ordering::SeqCst);
            let previous = CURRENT.with(|cell| cell.borrow_mut().replace(Arc::clone(self)));
            // SAFETY: this thread exclusively drives the coroutine (state
            // machine invariant); the contexts are not aliased concurrently
            // and the loaded context's stack is attached and mapped.
            unsafe { context::switch_context(self.host_ctx.get(), self.coro_ctx.get()) };
            CURRENT.with(|cell| *cell.borrow_mut() = previous);

            match self.state.load(Ordering::SeqCst) {
                DONE => {
                    let mut slot = self.stack.lock();
                    if let StackSlot::Attached(stack) =
                        std::mem::replace(&mut *slot, StackSlot::Empty)
                    {
                        drop(slot);
                        self.pool.release(stack);
                    }
                    return;
                }
                SUSPENDING => {
                    if self
                        .state
                        .compare_exchange(SUSPENDING, SUSPENDED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        if self.reschedule.swap(false, Ordering::SeqCst) {
                            if self
                                .state
                                .compare_exchange(
                                    SUSPENDED,
                                    RESTARTING,
                                    Ordering::SeqCst,
                                    Ordering::SeqCst,
                                )
                                .is_ok()
                            {
                                let submitter = self.submitter();
                                let coroutine = Arc::clone(self);
                                submitter.submit(Box::new(move || coroutine.enter()));
                            }
                        } else {
                            self.pool.register_donor(Arc::downgrade(self));
                        }
                        return;
                    }
                    // A resume raced the suspension (suspending → restarting);
                    // continue on this thread without going through the queue.
                    continue;
                }
                other => {
                    debug_assert!(false, "unexpected coroutine state after switch: {other}");
                    return;
                }
            }
        }
    }

    /// Marks the intent to suspend. The caller must then check its await
    /// cell and either call [`Self::abort_suspend`] (fast path) or
    /// [`Self::suspend_switch`].
    pub(crate) fn begin_suspend(&self) {
        self.state.store(SUSPENDING, Ordering::SeqCst);
    }

    /// Rolls the suspension intent back: the callback already fired, so the
    /// context switch is elided.
    pub(crate) fn abort_suspend(&self) {
        self.state.store(RUNNING, Ordering::SeqCst);
    }

    /// Switches from the coroutine stack back to the host. Returns when the
    /// coroutine is next resumed.
    pub(crate) fn suspend_switch(&self) {
        // SAFETY: called on this coroutine's own stack while the host
        // context saved by `enter` is live in the host's `enter` frame.
        unsafe { context::switch_context(self.coro_ctx.get(), self.host_ctx.get()) };
    }

    /// Called by the one-shot resume callback after the await cell fired.
    ///
    /// Decides, against the suspension handshake, whether the coroutine
    /// needs scheduling:
    /// - `running`: the callback fired before the coroutine committed; the
    ///   awaiter sees the fired cell and elides the switch.
    /// - `suspending`: flag `restarting`; the suspending thread re-enters
    ///   inline instead of parking.
    /// - `suspended`: this call won the resume race; submit a continuation.
    pub(crate) fn signal_resume(self: &Arc<Self>) {
        loop {
            match self.state.load(Ordering::SeqCst) {
                RUNNING | PREPARED | RESTARTING | DONE => return,
                SUSPENDING => {
                    if self
                        .state
                        .compare_exchange(
                            SUSPENDING,
                            RESTARTING,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                SUSPENDED => {
                    if self
                        .state
                        .compare_exchange(SUSPENDED, RESTARTING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let submitter = self.submitter();
                        let coroutine = Arc::clone(self);
                        submitter.submit(Box::new(move || coroutine.enter()));
                        return;
                    }
                }
                other => {
                    debug_assert!(false, "invalid coroutine state in resume: {other}");
                    return;
                }
            }
        }
    }

    /// Donates the stack of a suspended coroutine, parking its live frames
    /// on the heap. Returns `None` unless the coroutine is suspended with an
    /// attached stack right now.
    pub(crate) fn try_spill(self: &Arc<Self>) -> Option<CoroStack> {
        let mut slot = self.stack.try_lock()?;
        if self.state.load(Ordering::SeqCst) != SUSPENDED {
            return None;
        }
        let StackSlot::Attached(stack) = &*slot else {
            return None;
        };
        let top = stack.top() as usize;
        // SAFETY: the coroutine is suspended and cannot run while we hold
        // the stack-slot lock (enter() locks it before switching in).
        let sp = unsafe { (*self.coro_ctx.get()).sp } as usize;
        if sp < stack.usable_bottom() || sp > top {
            tracing::warn!("refusing to spill: saved stack pointer outside the stack");
            return None;
        }
        let used = top - sp;
        let mut frames = vec![0u8; used];
        // SAFETY: [sp, top) is mapped, owned by the suspended coroutine, and
        // not being mutated (see above).
        unsafe { std::ptr::copy_nonoverlapping(sp as *const u8, frames.as_mut_ptr(), used) };
        let spill = SpillBuffer {
            frames,
            old_top: top,
            old_base: stack.base_addr(),
        };
        let StackSlot::Attached(stack) = std::mem::replace(&mut *slot, StackSlot::Spilled(spill))
        else {
            unreachable!("slot checked above");
        };
        tracing::debug!(bytes = used, "spilled suspended coroutine stack");
        Some(stack)
    }

    /// Attaches a stack: fresh for first entry, or restored from spill.
    fn prepare_stack(&self) -> Result<()> {
        let mut slot = self.stack.lock();
        if matches!(&*slot, StackSlot::Attached(_)) {
            return Ok(());
        }
        match std::mem::replace(&mut *slot, StackSlot::Empty) {
            StackSlot::Empty => {
                let stack = self.pool.acquire()?;
                // SAFETY: `stack.top()` bounds a fresh mapped region large
                // enough for the initial switch frame.
                let ctx = unsafe { context::prepare_context(stack.top()) };
                // SAFETY: nothing else can touch the context before the
                // first switch; we hold the stack-slot lock.
                unsafe { *self.coro_ctx.get() = ctx };
                *slot = StackSlot::Attached(stack);
            }
            StackSlot::Spilled(buffer) => {
                let stack = self.pool.acquire_preferring(buffer.old_base)?;
                self.restore_from_spill(&buffer, &stack);
                *slot = StackSlot::Attached(stack);
            }
            StackSlot::Attached(_) => unreachable!("checked above"),
        }
        Ok(())
    }

    /// Copies parked frames back onto a stack and fixes the saved context.
    ///
    /// When the region differs from the original, the frames land at the
    /// same offsets from the top and the saved stack/frame pointers are
    /// rebased by the region delta. This relies on the design contract that
    /// no interior pointer into the stack outlives a suspension without the
    /// runtime's knowledge.
    fn restore_from_spill(&self, buffer: &SpillBuffer, stack: &CoroStack) {
        let new_top = stack.top() as usize;
        let used = buffer.frames.len();
        let new_sp = new_top - used;
        // SAFETY: [new_sp, new_top) lies within the acquired stack's usable
        // region (all pool stacks share one size).
        unsafe {
            std::ptr::copy_nonoverlapping(buffer.frames.as_ptr(), new_sp as *mut u8, used);
            (*self.coro_ctx.get()).sp = new_sp as *mut u8;
        }
        let delta = new_top as isize - buffer.old_top as isize;
        if delta != 0 {
            tracing::debug!(delta, "restoring spilled stack into a relocated region");
            let old_sp = buffer.old_top - used;
            // SAFETY: the frame-pointer slot lies within the just-restored
            // switch frame at `new_sp`.
            unsafe {
                let fp_slot = (new_sp + context::FRAME_POINTER_OFFSET) as *mut usize;
                let fp = *fp_slot;
                if fp >= old_sp && fp < buffer.old_top {
                    *fp_slot = (fp as isize + delta) as usize;
                }
            }
        } else {
            tracing::trace!(bytes = used, "restored spilled stack in place");
        }
    }

    /// Terminal switch out of a completed coroutine. Runs on the coroutine
    /// stack; control never comes back.
    fn finish(&self) -> ! {
        self.state.store(DONE, Ordering::SeqCst);
        // SAFETY: switching back to the host context saved by `enter`.
        unsafe { context::switch_context(self.coro_ctx.get(), self.host_ctx.get()) };
        unreachable!("completed coroutine was resumed");
    }
}

impl Drop for CoroutineCore {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::SeqCst);
        if !matches!(state, DONE | PREPARED) {
            // The stack (if attached) unmaps via CoroStack::drop; locals on
            // it are leaked, not unwound.
            tracing::warn!(state, "coroutine dropped while suspended");
        }
    }
}

/// First frame on every coroutine stack. Never returns; unwinding is caught
/// here so it cannot cross the context-switch boundary.
pub(crate) extern "C" fn coroutine_entry() -> ! {
    let coroutine = current().expect("coroutine entry without a current coroutine");
    let body = coroutine.body.lock().take();
    if let Some(body) = body {
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
            tracing::error!(
                panic = %panic_message(panic.as_ref()),
                "unhandled panic in fire-and-forget coroutine; aborting"
            );
            drop(panic);
            std::process::abort();
        }
    }
    let core_ptr: *const CoroutineCore = Arc::as_ptr(&coroutine);
    drop(coroutine);
    // SAFETY: the host's `enter` frame holds its own Arc until the final
    // switch hands control back to it, so the core outlives this call.
    unsafe { (*core_ptr).finish() }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The one-shot rendezvous between an awaiting coroutine and its resume
/// callback.
pub(crate) struct AwaitCell<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: `value` is written exactly once by the CAS winner (armed→firing)
// and read exactly once after `fired` is observed; the atomic state orders
// the two.
unsafe impl<T: Send> Send for AwaitCell<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for AwaitCell<T> {}

impl<T> AwaitCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(CELL_ARMED),
            value: UnsafeCell::new(None),
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CELL_FIRED
    }

    /// Takes the fired value. Must only be called after `is_fired`.
    pub(crate) fn take(&self) -> T {
        debug_assert!(self.is_fired());
        // SAFETY: `fired` was observed, so the writer is done and nobody
        // else takes (single awaiter).
        unsafe { (*self.value.get()).take() }.expect("await cell fired without a value")
    }
}

/// One-shot continuation handed to an [`await_callback`] registrant.
///
/// Cloneable so that racing completers (a result and a timeout, say) can
/// each hold one; the first `resume` wins and the rest are no-ops.
///
/// [`await_callback`]: super::await_callback
pub struct ResumeHandle<T> {
    cell: Arc<AwaitCell<T>>,
    coroutine: Arc<CoroutineCore>,
}

impl<T> Clone for ResumeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            coroutine: Arc::clone(&self.coroutine),
        }
    }
}

impl<T> std::fmt::Debug for ResumeHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeHandle").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ResumeHandle<T> {
    /// Delivers the awaited value and wakes the coroutine.
    ///
    /// Exactly one `resume` across all clones takes effect; later calls are
    /// no-ops. May be called from any thread.
    pub fn resume(self, value: T) {
        if self
            .cell
            .state
            .compare_exchange(CELL_ARMED, CELL_FIRING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // SAFETY: the CAS above makes this the unique writer.
        unsafe { *self.cell.value.get() = Some(value) };
        self.cell.state.store(CELL_FIRED, Ordering::SeqCst);
        self.coroutine.signal_resume();
    }
}

/// Suspends the current coroutine until the handle passed to `register` is
/// resumed. Core of every await primitive.
pub(crate) fn await_callback<T, F>(register: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(ResumeHandle<T>),
{
    let coroutine = current().ok_or_else(|| {
        Error::new(ErrorKind::NotInsideCoroutine).with_context("await requires a coroutine")
    })?;
    let cell = Arc::new(AwaitCell::new());
    register(ResumeHandle {
        cell: Arc::clone(&cell),
        coroutine: Arc::clone(&coroutine),
    });
    // Commit to suspension, then re-check: if the registrant resumed
    // synchronously, skip the context switch entirely.
    coroutine.begin_suspend();
    if cell.is_fired() {
        coroutine.abort_suspend();
    } else {
        coroutine.suspend_switch();
    }
    Ok(cell.take())
}
