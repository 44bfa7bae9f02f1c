//! Compare-and-swap helpers over packed atomic state words.
//!
//! Channels and the coroutine runtime encode their state machines in a single
//! `AtomicU64` so that every transition is one CAS. The word layout is:
//! high byte = mode, low 56 bits = sign-extended count.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of bits used by the signed count.
const COUNT_BITS: u32 = 56;
/// Mask selecting the count bits.
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Packs a signed count and a mode byte into one state word.
#[inline]
pub(crate) fn pack(count: i64, mode: u8) -> u64 {
    debug_assert!(
        (-(1i64 << (COUNT_BITS - 1))..(1i64 << (COUNT_BITS - 1))).contains(&count),
        "count out of 56-bit range: {count}"
    );
    (u64::from(mode) << COUNT_BITS) | ((count as u64) & COUNT_MASK)
}

/// Unpacks a state word into `(count, mode)`.
#[inline]
pub(crate) fn unpack(word: u64) -> (i64, u8) {
    let mode = (word >> COUNT_BITS) as u8;
    // Sign-extend the low 56 bits.
    let count = (((word & COUNT_MASK) << 8) as i64) >> 8;
    (count, mode)
}

/// Runs a CAS loop applying `apply` until it sticks or `apply` declines.
///
/// Returns `(old, Some(new))` when a transition was installed, or
/// `(old, None)` when `apply` returned `None` for the current value
/// (the state refuses the transition, e.g. a terminal mode).
pub(crate) fn update<F>(cell: &AtomicU64, mut apply: F) -> (u64, Option<u64>)
where
    F: FnMut(u64) -> Option<u64>,
{
    let mut current = cell.load(Ordering::Acquire);
    loop {
        let Some(next) = apply(current) else {
            return (current, None);
        };
        match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (current, Some(next)),
            Err(actual) => current = actual,
        }
    }
}
