//! # Per-Slot Bit-Spinlock
//!
//! Each slot's flags word carries a single lock bit. Acquiring the lock is
//! an atomic fetch-or of that bit; releasing clears it with release
//! ordering. The lock protects every non-atomic field of the slot and all
//! flag mutations other than the lock bit itself.
//!
//! ## Why a bit-spinlock?
//!
//! A device may have millions of slots. A full mutex per slot would cost
//! an order of magnitude more memory than the metadata it protects. The
//! lock bit lives in the word we already store, and critical sections are
//! short (flag flips, a decompression at most), so spinning is cheap.
//!
//! ## Discipline
//!
//! - The lock is never held across blocking I/O or a pool allocation that
//!   may stall.
//! - A thread examining multiple slots takes them one at a time; there is
//!   no ordering between distinct slots and no global table lock.
//! - `try_lock` exists for the free-notify path, which must not contend
//!   with a holder.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::LOCK_BIT;

const LOCK: u64 = 1 << LOCK_BIT;

/// Spin until the lock bit is ours. Acquire ordering on success pairs with
/// the release in `unlock`.
pub(super) fn lock(flags: &AtomicU64) {
    loop {
        let prev = flags.fetch_or(LOCK, Ordering::Acquire);
        if prev & LOCK == 0 {
            return;
        }
        while flags.load(Ordering::Relaxed) & LOCK != 0 {
            std::hint::spin_loop();
        }
    }
}

/// Single attempt; returns true if the lock was taken.
pub(super) fn try_lock(flags: &AtomicU64) -> bool {
    flags.fetch_or(LOCK, Ordering::Acquire) & LOCK == 0
}

pub(super) fn unlock(flags: &AtomicU64) {
    flags.fetch_and(!LOCK, Ordering::Release);
}
