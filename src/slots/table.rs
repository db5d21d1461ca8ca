//! # Slot Table
//!
//! One slot of metadata per logical page of the device, allocated lazily
//! when the disk size is configured and freed only on reset.
//!
//! ## Word Packing
//!
//! Each slot packs three things into a single `AtomicU64`:
//!
//! ```text
//! bits 0..13    stored object size (0..=PAGE_SIZE)
//! bit  13       LOCK (bit-spinlock, see `lock.rs`)
//! bits 14..20   SAME, WB, UNDER_WB, HUGE, IDLE, COMPRESS_LOW
//! bits 24..27   idle epoch counter (saturating)
//! ```
//!
//! Writing the size field preserves everything above it; clearing the idle
//! counter leaves the IDLE flag alone. The lock bit shares the word, so
//! every mutation uses atomic read-modify-write operations whose masks
//! exclude the lock bit — a concurrent locker's fetch-or can never be lost.
//!
//! ## Payload
//!
//! The fields that do not fit in the word (`entry`, `element`, `ac_time`)
//! live in an `UnsafeCell` guarded by the lock bit. `SlotGuard` is the only
//! way to reach them: it is handed out by `lock`/`try_lock` and releases
//! the bit on drop.
//!
//! ## Flag Semantics
//!
//! - `SAME`: the page is a single repeated machine word; `element` holds
//!   the word, no entry exists.
//! - `WB`: the payload was evicted; `element` holds the backing block
//!   index, no entry exists.
//! - `UNDER_WB`: a writeback batch owns the payload; nobody else may free
//!   or rewrite the slot, and only that batch clears the flag.
//! - `HUGE`: stored uncompressed, size == PAGE_SIZE.
//! - `IDLE` + the epoch counter: how many idle passes the slot survived
//!   without an access.
//! - `COMPRESS_LOW`: compression saved less than the configured ratio;
//!   the slot is an eviction candidate.
//!
//! A slot is *allocated* iff its size is nonzero or `SAME` or `WB` is set.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{
    IDLE_COUNT_MASK, IDLE_COUNT_MAX, IDLE_COUNT_SHIFT, LOCK_BIT, SIZE_MASK,
};
use crate::memory::Entry;

use super::lock;

/// Flag bits above the lock bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotFlag {
    /// Page is a repeated machine word stored in `element`.
    Same = 0,
    /// Payload evicted to the backing device; `element` is the block index.
    Wb = 1,
    /// A writeback batch is in flight for this slot.
    UnderWb = 2,
    /// Stored uncompressed at full page size.
    Huge = 3,
    /// Survived at least one idle epoch unread.
    Idle = 4,
    /// Compression ratio below the eviction threshold.
    CompressLow = 5,
}

impl SlotFlag {
    #[inline]
    pub const fn bit(self) -> u64 {
        1 << (LOCK_BIT + 1 + self as u32)
    }
}

/// Lock-protected slot fields that do not fit in the flags word.
#[derive(Debug, Default)]
pub struct SlotData {
    /// Compressed payload reference, when the slot holds one.
    pub entry: Option<Arc<Entry>>,
    /// Same-fill word or backing block index, depending on flags.
    pub element: u64,
    /// Last access time, for diagnostics.
    pub ac_time: Option<Instant>,
}

/// Metadata for one logical page.
#[derive(Debug)]
pub struct Slot {
    flags: AtomicU64,
    data: UnsafeCell<SlotData>,
}

// SAFETY: `data` is only reached through `SlotGuard`, which holds the
// slot's lock bit for its lifetime. The flags word itself is atomic.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            flags: AtomicU64::new(0),
            data: UnsafeCell::new(SlotData::default()),
        }
    }
}

/// The per-device slot array.
#[derive(Debug)]
pub struct SlotTable {
    slots: Box<[Slot]>,
}

impl SlotTable {
    /// Allocate a zeroed table with one slot per page.
    pub fn new(nr_pages: u64) -> Self {
        let slots = (0..nr_pages).map(|_| Slot::new()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Blocking acquire of a slot's lock.
    pub fn lock(&self, index: u64) -> SlotGuard<'_> {
        let slot = &self.slots[index as usize];
        lock::lock(&slot.flags);
        SlotGuard { slot, index }
    }

    /// Non-blocking acquire, used by the free-notify path.
    pub fn try_lock(&self, index: u64) -> Option<SlotGuard<'_>> {
        let slot = &self.slots[index as usize];
        if lock::try_lock(&slot.flags) {
            Some(SlotGuard { slot, index })
        } else {
            None
        }
    }
}

/// Exclusive access to one locked slot. Dropping the guard releases the
/// lock bit; every accessor below requires the guard and therefore the
/// lock.
pub struct SlotGuard<'a> {
    slot: &'a Slot,
    index: u64,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> u64 {
        self.index
    }

    #[inline]
    fn word(&self) -> u64 {
        self.slot.flags.load(Ordering::Relaxed)
    }

    /// Replace the bits selected by `mask` with `value`. Two RMW steps are
    /// used instead of a plain store so a concurrent locker's fetch-or of
    /// the lock bit is never overwritten; `mask` never covers the lock bit.
    #[inline]
    fn update_bits(&self, mask: u64, value: u64) {
        debug_assert_eq!(value & !mask, 0);
        debug_assert_eq!(mask & (1 << LOCK_BIT), 0);
        self.slot.flags.fetch_and(!mask, Ordering::Relaxed);
        self.slot.flags.fetch_or(value, Ordering::Relaxed);
    }

    pub fn test_flag(&self, flag: SlotFlag) -> bool {
        self.word() & flag.bit() != 0
    }

    pub fn set_flag(&self, flag: SlotFlag) {
        self.slot.flags.fetch_or(flag.bit(), Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: SlotFlag) {
        self.slot.flags.fetch_and(!flag.bit(), Ordering::Relaxed);
    }

    /// Stored object size in bytes.
    pub fn size(&self) -> usize {
        (self.word() & SIZE_MASK) as usize
    }

    /// Set the size field, preserving flags and the idle counter.
    pub fn set_size(&self, size: usize) {
        self.update_bits(SIZE_MASK, size as u64 & SIZE_MASK);
    }

    pub fn idle_count(&self) -> u32 {
        ((self.word() & IDLE_COUNT_MASK) >> IDLE_COUNT_SHIFT) as u32
    }

    /// Reset only the idle counter; the IDLE flag is untouched.
    pub fn clear_idle_count(&self) {
        self.update_bits(IDLE_COUNT_MASK, 0);
    }

    /// Saturating increment of the idle epoch counter.
    pub fn inc_idle_count(&self) {
        let count = self.idle_count();
        if count < IDLE_COUNT_MAX {
            self.update_bits(IDLE_COUNT_MASK, ((count + 1) as u64) << IDLE_COUNT_SHIFT);
        }
    }

    /// A slot holds data iff it has a nonzero size or is same-filled or
    /// written back.
    pub fn allocated(&self) -> bool {
        self.size() > 0 || self.test_flag(SlotFlag::Same) || self.test_flag(SlotFlag::Wb)
    }

    /// Note an access: the slot is no longer idle.
    pub fn mark_accessed(&mut self) {
        self.clear_flag(SlotFlag::Idle);
        self.clear_idle_count();
        self.data_mut().ac_time = Some(Instant::now());
    }

    pub fn data(&self) -> &SlotData {
        // SAFETY: the guard holds the slot's lock bit, so no other thread
        // can reach `data` for the guard's lifetime.
        unsafe { &*self.slot.data.get() }
    }

    pub fn data_mut(&mut self) -> &mut SlotData {
        // SAFETY: as above, plus `&mut self` excludes aliasing through
        // this guard.
        unsafe { &mut *self.slot.data.get() }
    }

    pub fn element(&self) -> u64 {
        self.data().element
    }

    pub fn set_element(&mut self, element: u64) {
        self.data_mut().element = element;
    }

    pub fn entry(&self) -> Option<&Arc<Entry>> {
        self.data().entry.as_ref()
    }

    pub fn set_entry(&mut self, entry: Arc<Entry>) {
        self.data_mut().entry = Some(entry);
    }

    pub fn take_entry(&mut self) -> Option<Arc<Entry>> {
        self.data_mut().entry.take()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        lock::unlock(&self.slot.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn new_table_slots_are_unallocated() {
        let table = SlotTable::new(8);

        let slot = table.lock(0);
        assert!(!slot.allocated());
        assert_eq!(slot.size(), 0);
        assert_eq!(slot.idle_count(), 0);
    }

    #[test]
    fn set_size_preserves_flags_and_idle_count() {
        let table = SlotTable::new(1);
        let slot = table.lock(0);

        slot.set_flag(SlotFlag::Huge);
        slot.inc_idle_count();
        slot.set_size(PAGE_SIZE);

        assert!(slot.test_flag(SlotFlag::Huge));
        assert_eq!(slot.idle_count(), 1);
        assert_eq!(slot.size(), PAGE_SIZE);

        slot.set_size(100);
        assert!(slot.test_flag(SlotFlag::Huge));
        assert_eq!(slot.size(), 100);
    }

    #[test]
    fn clear_idle_count_keeps_idle_flag() {
        let table = SlotTable::new(1);
        let slot = table.lock(0);

        slot.set_flag(SlotFlag::Idle);
        slot.inc_idle_count();
        slot.inc_idle_count();
        slot.clear_idle_count();

        assert!(slot.test_flag(SlotFlag::Idle));
        assert_eq!(slot.idle_count(), 0);
    }

    #[test]
    fn idle_count_saturates() {
        let table = SlotTable::new(1);
        let slot = table.lock(0);

        for _ in 0..20 {
            slot.inc_idle_count();
        }

        assert_eq!(slot.idle_count(), IDLE_COUNT_MAX);
    }

    #[test]
    fn allocated_for_same_and_wb_without_size() {
        let table = SlotTable::new(2);

        let slot = table.lock(0);
        slot.set_flag(SlotFlag::Same);
        assert!(slot.allocated());
        drop(slot);

        let slot = table.lock(1);
        slot.set_flag(SlotFlag::Wb);
        assert!(slot.allocated());
    }

    #[test]
    fn mark_accessed_clears_idle_state() {
        let table = SlotTable::new(1);
        let mut slot = table.lock(0);

        slot.set_flag(SlotFlag::Idle);
        slot.inc_idle_count();
        slot.mark_accessed();

        assert!(!slot.test_flag(SlotFlag::Idle));
        assert_eq!(slot.idle_count(), 0);
        assert!(slot.data().ac_time.is_some());
    }

    #[test]
    fn try_lock_contention_and_release() {
        let table = SlotTable::new(1);

        let guard = table.lock(0);
        assert!(table.try_lock(0).is_none());
        drop(guard);
        assert!(table.try_lock(0).is_some());
    }

    #[test]
    fn element_and_entry_roundtrip() {
        let table = SlotTable::new(1);
        let mut slot = table.lock(0);

        slot.set_element(0x5A5A_5A5A);
        assert_eq!(slot.element(), 0x5A5A_5A5A);
        assert!(slot.entry().is_none());
        assert!(slot.take_entry().is_none());
    }
}
