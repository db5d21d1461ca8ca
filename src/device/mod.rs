//! # Device Core
//!
//! A [`Device`] is one compressed RAM block device. Its life cycle is
//! one-shot:
//!
//! ```text
//! unconfigured ──set_disksize──> configured ──reset──> unconfigured
//! ```
//!
//! ## Locking
//!
//! The init-lock (`inner`) is a reader/writer lock over everything the
//! configured/reset transition replaces: the runtime state (slot table,
//! pool, codec, dedup index) and the backing store. The data path takes
//! it for read; configuration mutations take it for write. Per-slot state
//! is protected by each slot's own bit-spinlock, never by the init-lock.
//!
//! ## Reset protocol
//!
//! Reset is refused while anyone holds the device open. A claim latch is
//! raised first so new opens fail, then the openers count is re-checked:
//! `open` increments before checking the latch and backs out if it is
//! set, so the pair can never both succeed.

pub mod control;
pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use log::info;
use parking_lot::{Mutex, RwLock};

use crate::backing::{BackingDev, BackingStore};
use crate::codec::{self, Codec, CodecStreams};
use crate::config::{
    DEFAULT_LOW_COMPRESS_RATIO, IDLE_COUNT_MAX, MAX_WRITEBACK_SIZE, PAGE_SIZE,
};
use crate::dedup::DedupIndex;
use crate::io;
use crate::memory::{PagePool, SlabPool};
use crate::slots::{SlotFlag, SlotTable};
use crate::stats::{self, DeviceStats};

pub use registry::Registry;

/// State that exists only while the device is configured.
pub(crate) struct Runtime {
    pub disksize: u64,
    pub nr_pages: u64,
    pub table: SlotTable,
    pub pool: Arc<dyn PagePool>,
    pub codec: Arc<dyn Codec>,
    pub streams: CodecStreams,
    pub dedup: Option<DedupIndex>,
    pub huge_class_size: usize,
}

/// Everything guarded by the init-lock.
pub(crate) struct Inner {
    pub runtime: Option<Runtime>,
    pub backing: Option<BackingStore>,
    pub compressor: String,
    pub use_dedup: bool,
    pub limit_pages: u64,
}

/// Writeback budget, shared between the control surface and the batch
/// reconciliation path.
#[derive(Debug, Default)]
pub(crate) struct WbLimit {
    pub enable: bool,
    /// Remaining budget in 4 KiB units.
    pub budget: u64,
}

pub struct Device {
    id: u32,
    pub(crate) inner: RwLock<Inner>,
    pub(crate) stats: Arc<DeviceStats>,
    pub(crate) wb_limit: Mutex<WbLimit>,
    pub(crate) wb_cancel: AtomicBool,
    pub(crate) low_ratio: AtomicU32,
    /// Contiguous staging pages for writeback batches.
    pub(crate) staging: Mutex<Box<[u8]>>,
    claim: AtomicBool,
    openers: AtomicU32,
}

impl Device {
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: RwLock::new(Inner {
                runtime: None,
                backing: None,
                compressor: "lz4".to_string(),
                use_dedup: false,
                limit_pages: 0,
            }),
            stats: Arc::new(DeviceStats::new()),
            wb_limit: Mutex::new(WbLimit::default()),
            wb_cancel: AtomicBool::new(false),
            low_ratio: AtomicU32::new(DEFAULT_LOW_COMPRESS_RATIO),
            staging: Mutex::new(vec![0u8; MAX_WRITEBACK_SIZE * PAGE_SIZE].into_boxed_slice()),
            claim: AtomicBool::new(false),
            openers: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn init_done(&self) -> bool {
        self.inner.read().runtime.is_some()
    }

    pub fn disksize(&self) -> u64 {
        self.inner
            .read()
            .runtime
            .as_ref()
            .map_or(0, |rt| rt.disksize)
    }

    /// Configure the device capacity, allocating the slot table, pool and
    /// codec. Allowed exactly once per life cycle.
    pub fn set_disksize(&self, bytes: u64) -> Result<()> {
        self.set_disksize_with_pool(bytes, Arc::new(SlabPool::new()))
    }

    /// As [`set_disksize`](Self::set_disksize) with a caller-provided pool
    /// implementation.
    pub fn set_disksize_with_pool(&self, bytes: u64, pool: Arc<dyn PagePool>) -> Result<()> {
        ensure!(bytes > 0, "disksize must be nonzero");

        let mut inner = self.inner.write();
        ensure!(
            inner.runtime.is_none(),
            "cannot change disksize for initialized device"
        );

        let disksize = bytes.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let nr_pages = disksize / PAGE_SIZE as u64;
        let codec = codec::create(&inner.compressor)?;
        let huge_class_size = pool.huge_class_size();
        let dedup = inner.use_dedup.then(DedupIndex::new);

        inner.runtime = Some(Runtime {
            disksize,
            nr_pages,
            table: SlotTable::new(nr_pages),
            pool,
            codec,
            streams: CodecStreams::new(),
            dedup,
            huge_class_size,
        });

        info!(
            "cram{}: configured, {} pages, compressor {}",
            self.id, nr_pages, inner.compressor
        );
        Ok(())
    }

    /// Tear the device down to the unconfigured state. Refused while the
    /// device is open or another reset is in flight.
    pub fn reset(&self) -> Result<()> {
        ensure!(
            self.claim
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "device is claimed"
        );
        if self.openers.load(Ordering::Acquire) != 0 {
            self.claim.store(false, Ordering::Release);
            bail!("device has openers");
        }

        let result = self.reset_locked();
        self.claim.store(false, Ordering::Release);
        result
    }

    fn reset_locked(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.limit_pages = 0;

        let Some(rt) = inner.runtime.take() else {
            return Ok(());
        };

        // Return every slot's resources: entries to the pool, evicted
        // blocks to the bitmap.
        for index in 0..rt.nr_pages {
            let mut slot = rt.table.lock(index);
            io::free_slot(&mut slot, &rt, inner.backing.as_ref(), &self.stats);
        }
        drop(rt);

        inner.backing = None;
        self.stats.reset();
        *self.wb_limit.lock() = WbLimit::default();
        self.wb_cancel.store(false, Ordering::Relaxed);

        info!("cram{}: reset", self.id);
        Ok(())
    }

    /// Open the device. The handle pins it against reset and removal.
    pub fn open(self: &Arc<Self>) -> Result<DeviceHandle> {
        self.openers.fetch_add(1, Ordering::AcqRel);
        if self.claim.load(Ordering::Acquire) {
            self.openers.fetch_sub(1, Ordering::AcqRel);
            bail!("device is claimed for reset");
        }
        Ok(DeviceHandle {
            device: Arc::clone(self),
        })
    }

    pub fn openers(&self) -> u32 {
        self.openers.load(Ordering::Acquire)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.openers.load(Ordering::Acquire) != 0 || self.claim.load(Ordering::Acquire)
    }

    /// Attach a backing device for writeback. Only while unconfigured.
    pub fn set_backing_dev(&self, path: &std::path::Path) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(
            inner.runtime.is_none(),
            "cannot set backing device for initialized device"
        );
        let store = BackingStore::open(path, Arc::clone(&self.stats))?;
        info!(
            "cram{}: backing device {} ({} blocks)",
            self.id,
            path.display(),
            store.nr_pages()
        );
        inner.backing = Some(store);
        Ok(())
    }

    /// Attach an arbitrary [`BackingDev`] implementation. Only while
    /// unconfigured.
    pub fn set_backing(&self, dev: Arc<dyn BackingDev>) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(
            inner.runtime.is_none(),
            "cannot set backing device for initialized device"
        );
        inner.backing = Some(BackingStore::with_dev(dev, Arc::clone(&self.stats)));
        Ok(())
    }

    pub fn has_backing_dev(&self) -> bool {
        self.inner.read().backing.is_some()
    }

    /// Select the compression algorithm. Only while unconfigured.
    pub fn set_compressor(&self, name: &str) -> Result<()> {
        ensure!(
            codec::is_available(name),
            "unknown compression algorithm: {name}"
        );
        let mut inner = self.inner.write();
        ensure!(
            inner.runtime.is_none(),
            "cannot change algorithm for initialized device"
        );
        inner.compressor = name.to_string();
        Ok(())
    }

    pub fn compressor(&self) -> String {
        self.inner.read().compressor.clone()
    }

    /// Enable or disable deduplication. Only while unconfigured.
    pub fn set_use_dedup(&self, enable: bool) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(
            inner.runtime.is_none(),
            "cannot change dedup usage for initialized device"
        );
        inner.use_dedup = enable;
        Ok(())
    }

    pub fn use_dedup(&self) -> bool {
        self.inner.read().use_dedup
    }

    /// Cap the pool size in pages; zero means unbounded.
    pub fn set_mem_limit(&self, bytes: u64) {
        let mut inner = self.inner.write();
        inner.limit_pages = bytes.div_ceil(PAGE_SIZE as u64);
    }

    /// Reset the pool-usage high-water mark to the current usage.
    pub fn reset_mem_used_max(&self) {
        let inner = self.inner.read();
        if let Some(rt) = inner.runtime.as_ref() {
            self.stats.reset_used_max(rt.pool.total_pages());
        }
    }

    /// Trigger pool compaction.
    pub fn compact(&self) -> Result<()> {
        let inner = self.inner.read();
        let rt = runtime(&inner)?;
        let reclaimed = rt.pool.compact();
        stats::add(&self.stats.pages_compacted, reclaimed);
        Ok(())
    }

    /// Mark every eligible slot idle and bump its epoch counter. Returns
    /// how many slots newly became idle.
    ///
    /// Slots under writeback are skipped: marking them idle would defeat
    /// the repopulation race closure in the writeback batch.
    pub fn mark_idle(&self) -> Result<u64> {
        let inner = self.inner.read();
        let rt = runtime(&inner)?;
        let mut marked = 0;

        for index in 0..rt.nr_pages {
            let slot = rt.table.lock(index);
            if slot.size() > 0
                && slot.test_flag(SlotFlag::CompressLow)
                && !slot.test_flag(SlotFlag::UnderWb)
                && !slot.test_flag(SlotFlag::Wb)
            {
                slot.inc_idle_count();
                if !slot.test_flag(SlotFlag::Idle) {
                    slot.set_flag(SlotFlag::Idle);
                    marked += 1;
                }
            }
        }

        info!("cram{}: marked {} pages idle", self.id, marked);
        Ok(marked)
    }

    /// Clear idle state on every slot.
    pub fn mark_new(&self) -> Result<()> {
        let inner = self.inner.read();
        let rt = runtime(&inner)?;

        for index in 0..rt.nr_pages {
            let slot = rt.table.lock(index);
            slot.clear_flag(SlotFlag::Idle);
            slot.clear_idle_count();
        }
        Ok(())
    }

    /// Histogram of eviction candidates by idle epoch count. Index `i`
    /// counts candidates whose counter equals `i`.
    pub fn idle_histogram(&self) -> Result<Vec<u64>> {
        let inner = self.inner.read();
        let rt = runtime(&inner)?;
        let mut counts = vec![0u64; IDLE_COUNT_MAX as usize + 1];

        for index in 0..rt.nr_pages {
            let slot = rt.table.lock(index);
            if slot.size() > 0
                && slot.test_flag(SlotFlag::CompressLow)
                && !slot.test_flag(SlotFlag::Wb)
                && !slot.test_flag(SlotFlag::UnderWb)
            {
                counts[slot.idle_count() as usize] += 1;
            }
        }
        Ok(counts)
    }

    /// Per-slot state dump for diagnostics: index, seconds since last
    /// access, and the same/writeback/huge/idle flags.
    pub fn block_state(&self) -> Result<String> {
        let inner = self.inner.read();
        let rt = runtime(&inner)?;
        let mut out = String::new();

        for index in 0..rt.nr_pages {
            let slot = rt.table.lock(index);
            if !slot.allocated() {
                continue;
            }
            let age = slot
                .data()
                .ac_time
                .map_or(0.0, |t| t.elapsed().as_secs_f64());
            out.push_str(&format!(
                "{:12} {:12.6} {}{}{}{}\n",
                index,
                age,
                if slot.test_flag(SlotFlag::Same) { 's' } else { '.' },
                if slot.test_flag(SlotFlag::Wb) { 'w' } else { '.' },
                if slot.test_flag(SlotFlag::Huge) { 'h' } else { '.' },
                if slot.test_flag(SlotFlag::Idle) { 'i' } else { '.' },
            ));
        }
        Ok(out)
    }

    /// Ask a running writeback pass to stop at its next iteration.
    pub fn cancel_writeback(&self) {
        self.wb_cancel.store(true, Ordering::Release);
    }
}

/// Data-path helper: the runtime or a not-initialized error.
pub(crate) fn runtime(inner: &Inner) -> Result<&Runtime> {
    inner
        .runtime
        .as_ref()
        .ok_or_else(|| eyre::eyre!("device is not initialized"))
}

/// An open handle to a device. Dropping it releases the opener count.
pub struct DeviceHandle {
    device: Arc<Device>,
}

impl std::ops::Deref for DeviceHandle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.openers.fetch_sub(1, Ordering::AcqRel);
    }
}
