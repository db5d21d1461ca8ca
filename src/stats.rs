//! Device statistics counters.
//!
//! All counters are monotonic atomics updated from the data path without
//! locks. High-water marks (`max_used_pages`) are maintained with
//! compare-and-set retry loops so concurrent updaters never regress the
//! recorded maximum.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter set for one device. Zeroed on device reset.
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Total bytes of compressed payloads currently stored in the pool.
    pub compr_data_size: AtomicU64,
    /// Read operations handed to the page engine.
    pub num_reads: AtomicU64,
    /// Write operations handed to the page engine.
    pub num_writes: AtomicU64,
    /// Page reads that returned an error.
    pub failed_reads: AtomicU64,
    /// Page writes that returned an error.
    pub failed_writes: AtomicU64,
    /// Requests rejected for bad alignment or bounds.
    pub invalid_io: AtomicU64,
    /// Slots freed through discard or the free-notify hook.
    pub notify_free: AtomicU64,
    /// Pages stored as a repeated machine word.
    pub same_pages: AtomicU64,
    /// Currently allocated slots.
    pub pages_stored: AtomicU64,
    /// High-water mark of pool pages in use.
    pub max_used_pages: AtomicU64,
    /// Pages kept uncompressed because compression gained too little.
    pub huge_pages: AtomicU64,
    /// Pages flagged as compressing below the configured ratio.
    pub lowratio_pages: AtomicU64,
    /// Write slow-path entries (blocking pool allocation after a failed
    /// non-blocking attempt).
    pub writestall: AtomicU64,
    /// Free-notify calls that lost the slot-lock race.
    pub miss_free: AtomicU64,
    /// Pool pages reclaimed by compaction.
    pub pages_compacted: AtomicU64,
    /// Bytes saved by deduplication.
    pub dup_data_size: AtomicU64,
    /// Bytes of dedup entry metadata.
    pub meta_data_size: AtomicU64,
    /// Backing blocks currently allocated.
    pub bd_count: AtomicU64,
    /// Pages read back from the backing device.
    pub bd_reads: AtomicU64,
    /// Pages written to the backing device.
    pub bd_writes: AtomicU64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pool usage sample, ratcheting the high-water mark.
    pub fn update_used_max(&self, pages: u64) {
        let mut cur = self.max_used_pages.load(Ordering::Relaxed);
        while pages > cur {
            match self.max_used_pages.compare_exchange_weak(
                cur,
                pages,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Reset the high-water mark to the current pool usage.
    pub fn reset_used_max(&self, pages: u64) {
        self.max_used_pages.store(pages, Ordering::Relaxed);
    }

    /// Zero every counter. Only called with the device init-lock held for
    /// write, so plain stores are sufficient.
    pub fn reset(&self) {
        self.compr_data_size.store(0, Ordering::Relaxed);
        self.num_reads.store(0, Ordering::Relaxed);
        self.num_writes.store(0, Ordering::Relaxed);
        self.failed_reads.store(0, Ordering::Relaxed);
        self.failed_writes.store(0, Ordering::Relaxed);
        self.invalid_io.store(0, Ordering::Relaxed);
        self.notify_free.store(0, Ordering::Relaxed);
        self.same_pages.store(0, Ordering::Relaxed);
        self.pages_stored.store(0, Ordering::Relaxed);
        self.max_used_pages.store(0, Ordering::Relaxed);
        self.huge_pages.store(0, Ordering::Relaxed);
        self.lowratio_pages.store(0, Ordering::Relaxed);
        self.writestall.store(0, Ordering::Relaxed);
        self.miss_free.store(0, Ordering::Relaxed);
        self.pages_compacted.store(0, Ordering::Relaxed);
        self.dup_data_size.store(0, Ordering::Relaxed);
        self.meta_data_size.store(0, Ordering::Relaxed);
        self.bd_count.store(0, Ordering::Relaxed);
        self.bd_reads.store(0, Ordering::Relaxed);
        self.bd_writes.store(0, Ordering::Relaxed);
    }
}

/// Relaxed-increment helper; every counter above is a plain event count.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn dec(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

pub(crate) fn sub(counter: &AtomicU64, n: u64) {
    counter.fetch_sub(n, Ordering::Relaxed);
}
