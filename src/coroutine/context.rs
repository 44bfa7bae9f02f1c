//! Register-level context switching.
//!
//! A [`MachineContext`] is a saved stack pointer; the callee-saved registers
//! and the resume address live in a fixed-layout frame at that pointer,
//! pushed by [`switch_context`] itself. Switching away pushes the frame and
//! stores the stack pointer; switching in loads the stack pointer, pops the
//! frame, and returns into the saved resume address.
//!
//! Fresh coroutines get a hand-built frame whose resume address is an
//! architecture trampoline that aligns the stack and calls
//! [`super::core::coroutine_entry`].

#[cfg(not(unix))]
compile_error!("cofiber requires a unix target (mmap-backed coroutine stacks)");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("cofiber supports x86_64 and aarch64 only");

/// A suspended execution context: the stack pointer of its switch frame.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct MachineContext {
    pub(crate) sp: *mut u8,
}

impl MachineContext {
    /// An empty context; invalid until prepared or saved into.
    pub(crate) fn null() -> Self {
        Self {
            sp: std::ptr::null_mut(),
        }
    }
}

// SAFETY: the pointed-to frame is owned by the coroutine machinery; a
// context is only ever used by the single thread currently driving its
// coroutine.
unsafe impl Send for MachineContext {}

/// Size in bytes of the register frame pushed by [`switch_context`].
#[cfg(target_arch = "x86_64")]
pub(crate) const SWITCH_FRAME_SIZE: usize = 7 * 8;
/// Size in bytes of the register frame pushed by [`switch_context`].
#[cfg(target_arch = "aarch64")]
pub(crate) const SWITCH_FRAME_SIZE: usize = 160;

/// Byte offset (from the saved stack pointer) of the resume address slot.
#[cfg(target_arch = "x86_64")]
const RESUME_SLOT_OFFSET: usize = 6 * 8;
/// Byte offset (from the saved stack pointer) of the resume address slot.
#[cfg(target_arch = "aarch64")]
const RESUME_SLOT_OFFSET: usize = 152;

/// Byte offset (from the saved stack pointer) of the saved frame pointer.
///
/// Used when a spilled coroutine is restored onto a different stack region:
/// the saved frame pointer is rebased by the region delta.
#[cfg(target_arch = "x86_64")]
pub(crate) const FRAME_POINTER_OFFSET: usize = 5 * 8;
/// Byte offset (from the saved stack pointer) of the saved frame pointer.
#[cfg(target_arch = "aarch64")]
pub(crate) const FRAME_POINTER_OFFSET: usize = 144;

/// Saves the current context into `save` and resumes the context in `load`.
///
/// Returns (into `save`'s caller) when some other context later switches
/// back to `save`.
///
/// # Safety
///
/// * Both pointers must be valid and distinct.
/// * `load` must hold a context prepared by [`prepare_context`] or saved by
///   a previous `switch_context`, with its stack still mapped and unused by
///   any other thread.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(
    save: *mut MachineContext,
    load: *const MachineContext,
) {
    // System V AMD64: rbx, rbp, r12-r15 are callee-saved; everything else is
    // the caller's problem. The return address pushed by our caller's `call`
    // doubles as the resume address.
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Saves the current context into `save` and resumes the context in `load`.
///
/// # Safety
///
/// See the x86_64 variant.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(
    save: *mut MachineContext,
    load: *const MachineContext,
) {
    // AAPCS64: x19-x28, x29 (fp), and d8-d15 are callee-saved; x30 holds
    // the return address, which doubles as the resume address.
    core::arch::naked_asm!(
        "stp x29, x30, [sp, #-16]!",
        "stp x27, x28, [sp, #-16]!",
        "stp x25, x26, [sp, #-16]!",
        "stp x23, x24, [sp, #-16]!",
        "stp x21, x22, [sp, #-16]!",
        "stp x19, x20, [sp, #-16]!",
        "stp d14, d15, [sp, #-16]!",
        "stp d12, d13, [sp, #-16]!",
        "stp d10, d11, [sp, #-16]!",
        "stp d8, d9, [sp, #-16]!",
        "mov x9, sp",
        "str x9, [x0]",
        "ldr x9, [x1]",
        "mov sp, x9",
        "ldp d8, d9, [sp], #16",
        "ldp d10, d11, [sp], #16",
        "ldp d12, d13, [sp], #16",
        "ldp d14, d15, [sp], #16",
        "ldp x19, x20, [sp], #16",
        "ldp x21, x22, [sp], #16",
        "ldp x23, x24, [sp], #16",
        "ldp x25, x26, [sp], #16",
        "ldp x27, x28, [sp], #16",
        "ldp x29, x30, [sp], #16",
        "ret",
    )
}

/// Entry shim for fresh coroutines: align the stack per the calling
/// convention and call the runtime entry, which never returns.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    core::arch::naked_asm!(
        // rsp is 16-aligned here; `call` pushes the (never used) return
        // address, giving the entry the ABI-required rsp % 16 == 8.
        "call {entry}",
        "ud2",
        entry = sym super::core::coroutine_entry,
    )
}

/// Entry shim for fresh coroutines.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    core::arch::naked_asm!(
        "bl {entry}",
        "brk #0x1",
        entry = sym super::core::coroutine_entry,
    )
}

/// Builds a context that, when switched to, starts executing
/// [`super::core::coroutine_entry`] on the given stack.
///
/// # Safety
///
/// `stack_top` must be one-past-the-end of a mapped, writable stack region
/// with at least [`SWITCH_FRAME_SIZE`] + 16 usable bytes below it.
pub(crate) unsafe fn prepare_context(stack_top: *mut u8) -> MachineContext {
    let aligned_top = (stack_top as usize) & !15;
    let sp = (aligned_top - SWITCH_FRAME_SIZE) as *mut usize;
    let entry: unsafe extern "C" fn() -> ! = trampoline;
    // SAFETY: per the contract, [sp, aligned_top) lies within the mapped
    // stack; zero the register slots and install the trampoline as the
    // resume address.
    unsafe {
        for slot in 0..(SWITCH_FRAME_SIZE / 8) {
            *sp.add(slot) = 0;
        }
        *sp.byte_add(RESUME_SLOT_OFFSET) = entry as usize;
    }
    MachineContext { sp: sp.cast() }
}
