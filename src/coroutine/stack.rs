//! mmap-backed coroutine stacks with a guard page.
//!
//! Each stack is an anonymous private mapping with a `PROT_NONE` page at the
//! bottom so overflow faults instead of silently corrupting neighbouring
//! memory. Stacks grow downward; [`CoroStack::top`] is the initial stack
//! pointer region.

use crate::error::{Error, ErrorKind};

/// A coroutine stack: `usable_size` writable bytes above a guard page.
pub(crate) struct CoroStack {
    /// Base of the allocation (guard page starts here).
    base: *mut u8,
    /// Total allocation size (guard + usable).
    alloc_size: usize,
    /// Guard page size.
    guard_size: usize,
}

// SAFETY: the mapping is exclusively owned by the `CoroStack`; only the one
// thread currently driving the owning coroutine touches the memory.
unsafe impl Send for CoroStack {}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

impl CoroStack {
    /// Allocates a stack with `usable_size` bytes (rounded up to page size)
    /// plus one guard page at the bottom.
    pub(crate) fn new(usable_size: usize) -> Result<Self, Error> {
        let page = page_size();
        let usable = usable_size.div_ceil(page) * page;
        let guard = page;
        let alloc_size = guard + usable;

        // SAFETY: anonymous private mapping; fd = -1, offset = 0 is the
        // standard incantation for anonymous maps.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::new(ErrorKind::Internal)
                .with_context(format!("stack mmap of {alloc_size} bytes failed")));
        }

        // SAFETY: `base` is a live mapping and `guard` lies within it; the
        // bottom page becomes inaccessible so overflow faults loudly.
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if ret != 0 {
            // SAFETY: `base`/`alloc_size` match the mmap above.
            unsafe { libc::munmap(base, alloc_size) };
            return Err(
                Error::new(ErrorKind::Internal).with_context("stack guard mprotect failed")
            );
        }

        Ok(Self {
            base: base.cast::<u8>(),
            alloc_size,
            guard_size: guard,
        })
    }

    /// One past the highest usable byte (stacks grow downward).
    pub(crate) fn top(&self) -> *mut u8 {
        // SAFETY: `base + alloc_size` is one past the allocation; valid for
        // pointer arithmetic, never dereferenced as-is.
        unsafe { self.base.add(self.alloc_size) }
    }

    /// Base address of the allocation; stable identity for pool lookups.
    pub(crate) fn base_addr(&self) -> usize {
        self.base as usize
    }

    /// Lowest usable address (just above the guard page).
    pub(crate) fn usable_bottom(&self) -> usize {
        self.base as usize + self.guard_size
    }
}

impl Drop for CoroStack {
    fn drop(&mut self) {
        // SAFETY: `base`/`alloc_size` correspond to a live mapping that has
        // not yet been unmapped.
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.alloc_size);
        }
    }
}

impl std::fmt::Debug for CoroStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroStack")
            .field("base", &self.base)
            .field("alloc_size", &self.alloc_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_frees() {
        let stack = CoroStack::new(64 * 1024).expect("mmap failed");
        assert!(!stack.base.is_null());
        assert_eq!(stack.top() as usize, stack.base as usize + stack.alloc_size);
        assert!(stack.usable_bottom() > stack.base as usize);
        // Drop unmaps.
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = CoroStack::new(16 * 1024).expect("mmap failed");
        let bottom = stack.usable_bottom() as *mut u8;
        let len = stack.top() as usize - stack.usable_bottom();
        // SAFETY: [bottom, top) is the mapped read/write region.
        unsafe {
            std::ptr::write_bytes(bottom, 0xAB, len);
            assert_eq!(*bottom, 0xAB);
            assert_eq!(*stack.top().sub(1), 0xAB);
        }
    }

    #[test]
    fn rounds_up_to_page_size() {
        let stack = CoroStack::new(1).expect("mmap failed");
        let usable = stack.top() as usize - stack.usable_bottom();
        assert!(usable >= 1);
        assert_eq!(usable % page_size(), 0);
    }
}
