//! # I/O Engine
//!
//! Block requests enter here, are validated against the device geometry,
//! and are decomposed into page-sized operations against the slot table.
//!
//! ## Read path (per page)
//!
//! 1. Lock the slot and note the access.
//! 2. Evicted (`WB`) slots release the lock and read from the backing
//!    store.
//! 3. Empty and same-filled slots materialize from the stored word.
//! 4. Otherwise the pool payload is mapped read-only and either copied
//!    (huge) or decompressed, both under the slot lock — bounded CPU
//!    work, never I/O.
//!
//! ## Write path (per page)
//!
//! 1. Sub-page segments are read-modify-write through a temporary page.
//! 2. Same-filled pages store a single word and skip compression.
//! 3. A dedup hit reuses an existing entry.
//! 4. Otherwise compress; output at or above the pool's huge threshold is
//!    stored uncompressed at full page size.
//! 5. Pool allocation runs twice: a no-wait attempt while the compression
//!    stream is borrowed, then — after returning the stream and counting a
//!    write stall — a blocking attempt followed by recompression, since
//!    the workspace was given up.
//! 6. The slot is locked only for the final publish: free the old
//!    payload, install the new one, set the flags.
//!
//! ## Partial coverage
//!
//! Discard frees only fully covered pages; partially covered logical
//! blocks at the edges are skipped (discard is advisory). Write-zeroes
//! behaves like discard for full pages but explicitly zeroes the edges.

use std::sync::Arc;

use eyre::{bail, eyre, Result};
use log::error;

use crate::backing::BackingStore;
use crate::config::{
    LOGICAL_BLOCK_SIZE, PAGE_SIZE, SECTORS_PER_LOGICAL_BLOCK, SECTORS_PER_PAGE, SECTOR_SHIFT,
};
use crate::dedup::{page_checksum, ENTRY_META_SIZE};
use crate::device::{runtime, Device, Runtime};
use crate::memory::{AllocMode, Entry};
use crate::slots::{SlotFlag, SlotGuard};
use crate::stats::{self, DeviceStats};

/// One block-layer request. Reads and writes carry the caller's buffer;
/// lengths and sector offsets must be aligned to the logical block size.
pub enum BlockRequest<'a> {
    Read { sector: u64, buf: &'a mut [u8] },
    Write { sector: u64, data: &'a [u8] },
    Discard { sector: u64, len: u64 },
    WriteZeroes { sector: u64, len: u64 },
}

impl BlockRequest<'_> {
    fn sector(&self) -> u64 {
        match self {
            Self::Read { sector, .. }
            | Self::Write { sector, .. }
            | Self::Discard { sector, .. }
            | Self::WriteZeroes { sector, .. } => *sector,
        }
    }

    fn len(&self) -> u64 {
        match self {
            Self::Read { buf, .. } => buf.len() as u64,
            Self::Write { data, .. } => data.len() as u64,
            Self::Discard { len, .. } | Self::WriteZeroes { len, .. } => *len,
        }
    }
}

/// Bounds and alignment check against the configured capacity.
fn valid_io(disksize: u64, sector: u64, len: u64) -> bool {
    if sector % SECTORS_PER_LOGICAL_BLOCK != 0 {
        return false;
    }
    if len % LOGICAL_BLOCK_SIZE as u64 != 0 {
        return false;
    }
    let end = sector + (len >> SECTOR_SHIFT);
    let bound = disksize >> SECTOR_SHIFT;
    sector < bound && end <= bound
}

/// Everything a page operation needs, resolved once per request while the
/// init-lock is held for read.
pub(crate) struct IoCtx<'a> {
    pub dev: &'a Device,
    pub rt: &'a Runtime,
    pub backing: Option<&'a BackingStore>,
    pub limit_pages: u64,
}

impl Device {
    /// Validate and execute one block request.
    pub fn submit(&self, req: BlockRequest<'_>) -> Result<()> {
        let (sector, len) = (req.sector(), req.len());
        let inner = self.inner.read();
        let disksize = inner.runtime.as_ref().map_or(0, |rt| rt.disksize);

        if !valid_io(disksize, sector, len) {
            stats::inc(&self.stats.invalid_io);
            bail!("invalid I/O request: sector {sector}, {len} bytes");
        }

        let ctx = IoCtx {
            dev: self,
            rt: runtime(&inner)?,
            backing: inner.backing.as_ref(),
            limit_pages: inner.limit_pages,
        };

        match req {
            BlockRequest::Read { buf, .. } => ctx.read_segments(sector, buf),
            BlockRequest::Write { data, .. } => ctx.write_segments(sector, data),
            BlockRequest::Discard { len, .. } => ctx.discard(sector, len),
            BlockRequest::WriteZeroes { len, .. } => ctx.write_zeroes(sector, len),
        }
    }

    /// Read `buf.len()` bytes starting at `sector`.
    pub fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.submit(BlockRequest::Read { sector, buf })
    }

    /// Write `data` starting at `sector`.
    pub fn write(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.submit(BlockRequest::Write { sector, data })
    }

    /// Advisory discard of the given range.
    pub fn discard(&self, sector: u64, len: u64) -> Result<()> {
        self.submit(BlockRequest::Discard { sector, len })
    }

    /// Zero the given range.
    pub fn write_zeroes(&self, sector: u64, len: u64) -> Result<()> {
        self.submit(BlockRequest::WriteZeroes { sector, len })
    }

    /// Swap-layer notification that a page is no longer needed. Uses
    /// `try_lock` so a contended slot is skipped rather than waited on.
    pub fn slot_free_notify(&self, index: u64) {
        let inner = self.inner.read();
        let Ok(rt) = runtime(&inner) else {
            return;
        };
        if index >= rt.nr_pages {
            return;
        }

        stats::inc(&self.stats.notify_free);
        match rt.table.try_lock(index) {
            Some(mut slot) => {
                free_slot(&mut slot, rt, inner.backing.as_ref(), &self.stats);
            }
            None => stats::inc(&self.stats.miss_free),
        };
    }
}

impl IoCtx<'_> {
    fn stats(&self) -> &DeviceStats {
        &self.dev.stats
    }

    fn read_segments(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let mut index = sector / SECTORS_PER_PAGE;
        let mut offset = ((sector % SECTORS_PER_PAGE) << SECTOR_SHIFT) as usize;
        let mut pos = 0;

        while pos < buf.len() {
            let seg = (PAGE_SIZE - offset).min(buf.len() - pos);
            stats::inc(&self.stats().num_reads);

            let result = if seg == PAGE_SIZE {
                self.read_page(index, &mut buf[pos..pos + PAGE_SIZE], true)
            } else {
                let mut page = vec![0u8; PAGE_SIZE];
                self.read_page(index, &mut page, true).map(|()| {
                    buf[pos..pos + seg].copy_from_slice(&page[offset..offset + seg]);
                })
            };
            if let Err(e) = result {
                stats::inc(&self.stats().failed_reads);
                return Err(e);
            }

            pos += seg;
            index += 1;
            offset = 0;
        }
        Ok(())
    }

    fn write_segments(&self, sector: u64, data: &[u8]) -> Result<()> {
        let mut index = sector / SECTORS_PER_PAGE;
        let mut offset = ((sector % SECTORS_PER_PAGE) << SECTOR_SHIFT) as usize;
        let mut pos = 0;

        while pos < data.len() {
            let seg = (PAGE_SIZE - offset).min(data.len() - pos);
            stats::inc(&self.stats().num_writes);

            let result = if seg == PAGE_SIZE {
                self.store_page(index, &data[pos..pos + PAGE_SIZE])
            } else {
                self.write_partial(index, offset, &data[pos..pos + seg])
            };
            if let Err(e) = result {
                stats::inc(&self.stats().failed_writes);
                return Err(e);
            }

            pos += seg;
            index += 1;
            offset = 0;
        }
        Ok(())
    }

    /// Read one full page into `page`. `access` updates the slot's idle
    /// state; the writeback scan passes `false` so staging a page does not
    /// un-idle it.
    pub(crate) fn read_page(&self, index: u64, page: &mut [u8], access: bool) -> Result<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let mut slot = self.rt.table.lock(index);
        if access {
            slot.mark_accessed();
        }

        if slot.test_flag(SlotFlag::Wb) {
            let blk = slot.element();
            drop(slot);
            let backing = self
                .backing
                .ok_or_else(|| eyre!("evicted slot {index} without a backing device"))?;
            return backing.read_page(blk, page);
        }

        if slot.entry().is_none() {
            let value = if slot.test_flag(SlotFlag::Same) {
                slot.element()
            } else {
                0
            };
            fill_page(page, value);
            return Ok(());
        }

        let entry = Arc::clone(slot.entry().expect("checked above"));
        let size = slot.size();
        let mut result = Ok(());
        self.rt.pool.map_ro(entry.handle(), &mut |src| {
            if size == PAGE_SIZE {
                page.copy_from_slice(&src[..PAGE_SIZE]);
            } else {
                result = self.rt.codec.decompress(&src[..size], page);
            }
        });
        drop(slot);

        if let Err(e) = result {
            error!("decompression failed for page {index}: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// Sub-page write: read the full page, patch the window, store it back.
    fn write_partial(&self, index: u64, offset: usize, data: &[u8]) -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        self.read_page(index, &mut page, true)?;
        page[offset..offset + data.len()].copy_from_slice(data);
        self.store_page(index, &page)
    }

    /// Store one full page into its slot.
    fn store_page(&self, index: u64, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let stats = self.stats();

        if let Some(element) = page_same_filled(page) {
            let mut slot = self.rt.table.lock(index);
            free_slot(&mut slot, self.rt, self.backing, stats);
            slot.set_flag(SlotFlag::Same);
            slot.set_element(element);
            drop(slot);

            stats::inc(&stats.same_pages);
            stats::inc(&stats.pages_stored);
            return Ok(());
        }

        let mut checksum = 0;
        let mut entry: Option<Arc<Entry>> = None;
        if let Some(dedup) = self.rt.dedup.as_ref() {
            checksum = page_checksum(page);
            entry = dedup.find(checksum, &mut |candidate| self.entry_matches(candidate, page));
            if let Some(hit) = entry.as_ref() {
                stats::add(&stats.dup_data_size, hit.len() as u64);
            }
        }

        let entry = match entry {
            Some(entry) => entry,
            None => self.compress_into_entry(page, checksum)?,
        };
        let comp_len = entry.len();

        let mut slot = self.rt.table.lock(index);
        free_slot(&mut slot, self.rt, self.backing, stats);

        if comp_len == PAGE_SIZE {
            slot.set_flag(SlotFlag::Huge);
            stats::inc(&stats.huge_pages);
        }
        slot.set_entry(entry);
        slot.set_size(comp_len);
        if compression_savings(comp_len) < self.dev.low_ratio.load(std::sync::atomic::Ordering::Relaxed) {
            slot.set_flag(SlotFlag::CompressLow);
            stats::inc(&stats.lowratio_pages);
        }
        drop(slot);

        stats::inc(&stats.pages_stored);
        Ok(())
    }

    /// Compress a page and place it in a fresh pool entry.
    fn compress_into_entry(&self, page: &[u8], checksum: u32) -> Result<Arc<Entry>> {
        let rt = self.rt;
        let stats = self.stats();

        let mut stream = rt.streams.get();
        let mut comp_len = match rt.codec.compress(page, &mut stream.buffer) {
            Ok(n) => n,
            Err(e) => {
                rt.streams.put(stream);
                error!("compression failed: {e}");
                return Err(e);
            }
        };
        if comp_len >= rt.huge_class_size {
            comp_len = PAGE_SIZE;
        }

        // Fast path: allocate without stalling while the stream is held.
        // On failure the stream goes back first — a blocked writer must
        // not starve other writers of workspaces — and the page is
        // compressed again afterwards because the workspace was given up.
        let mut handle = rt.pool.alloc(comp_len, AllocMode::NoWait);
        if handle.is_none() {
            rt.streams.put(stream);
            stats::inc(&stats.writestall);

            handle = rt.pool.alloc(comp_len, AllocMode::MayBlock);
            if handle.is_none() {
                bail!("out of pool memory for {comp_len} bytes");
            }

            stream = rt.streams.get();
            let n = match rt.codec.compress(page, &mut stream.buffer) {
                Ok(n) => n,
                Err(e) => {
                    rt.pool.free(handle.expect("allocated above"));
                    rt.streams.put(stream);
                    return Err(e);
                }
            };
            let clamped = if n >= rt.huge_class_size { PAGE_SIZE } else { n };
            debug_assert_eq!(clamped, comp_len, "recompression diverged");
            comp_len = clamped;
        }
        let handle = handle.expect("checked above");

        let alloced = rt.pool.total_pages();
        stats.update_used_max(alloced);
        if self.limit_pages != 0 && alloced > self.limit_pages {
            rt.pool.free(handle);
            rt.streams.put(stream);
            bail!("pool memory limit exceeded");
        }

        rt.pool.map_wo(handle, &mut |dst| {
            if comp_len == PAGE_SIZE {
                dst[..PAGE_SIZE].copy_from_slice(page);
            } else {
                dst[..comp_len].copy_from_slice(&stream.buffer[..comp_len]);
            }
        });
        rt.streams.put(stream);

        stats::add(&stats.compr_data_size, comp_len as u64);
        let entry = Arc::new(Entry::new(handle, comp_len, checksum));
        if let Some(dedup) = rt.dedup.as_ref() {
            dedup.insert(&entry);
            stats::add(&stats.meta_data_size, ENTRY_META_SIZE);
        }
        Ok(entry)
    }

    /// Dedup verification: does `candidate` decompress to exactly `page`?
    fn entry_matches(&self, candidate: &Entry, page: &[u8]) -> bool {
        let mut matches = false;
        if candidate.len() == PAGE_SIZE {
            self.rt.pool.map_ro(candidate.handle(), &mut |src| {
                matches = &src[..PAGE_SIZE] == page;
            });
        } else {
            let mut decompressed = vec![0u8; PAGE_SIZE];
            let mut ok = false;
            self.rt.pool.map_ro(candidate.handle(), &mut |src| {
                ok = self
                    .rt
                    .codec
                    .decompress(&src[..candidate.len()], &mut decompressed)
                    .is_ok();
            });
            matches = ok && decompressed == page;
        }
        matches
    }

    /// Free all fully covered pages; partially covered edges are skipped.
    fn discard(&self, sector: u64, len: u64) -> Result<()> {
        let mut index = sector / SECTORS_PER_PAGE;
        let offset = ((sector % SECTORS_PER_PAGE) << SECTOR_SHIFT) as usize;
        let mut n = len;

        if offset != 0 {
            let head = (PAGE_SIZE - offset) as u64;
            if n <= head {
                return Ok(());
            }
            n -= head;
            index += 1;
        }

        while n >= PAGE_SIZE as u64 {
            let mut slot = self.rt.table.lock(index);
            free_slot(&mut slot, self.rt, self.backing, self.stats());
            drop(slot);
            stats::inc(&self.stats().notify_free);
            index += 1;
            n -= PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Like discard, but partially covered edges are explicitly zeroed so
    /// the whole range reads back as zeros.
    fn write_zeroes(&self, sector: u64, len: u64) -> Result<()> {
        let mut index = sector / SECTORS_PER_PAGE;
        let mut offset = ((sector % SECTORS_PER_PAGE) << SECTOR_SHIFT) as usize;
        let mut n = len;
        let zeroes = vec![0u8; PAGE_SIZE];

        while n > 0 {
            let seg = (PAGE_SIZE - offset).min(n as usize);
            if seg == PAGE_SIZE {
                let mut slot = self.rt.table.lock(index);
                free_slot(&mut slot, self.rt, self.backing, self.stats());
                drop(slot);
                stats::inc(&self.stats().notify_free);
            } else {
                self.write_partial(index, offset, &zeroes[..seg])?;
            }
            n -= seg as u64;
            index += 1;
            offset = 0;
        }
        Ok(())
    }
}

/// Release everything a slot holds. Callers hold the slot lock; the lock
/// bit and `UNDER_WB` are deliberately left alone — clearing them is the
/// caller's job.
pub(crate) fn free_slot(
    slot: &mut SlotGuard<'_>,
    rt: &Runtime,
    backing: Option<&BackingStore>,
    stats: &DeviceStats,
) {
    slot.data_mut().ac_time = None;

    if slot.test_flag(SlotFlag::Idle) {
        slot.clear_flag(SlotFlag::Idle);
    }
    slot.clear_idle_count();

    if slot.test_flag(SlotFlag::CompressLow) {
        slot.clear_flag(SlotFlag::CompressLow);
        stats::dec(&stats.lowratio_pages);
    }

    if slot.test_flag(SlotFlag::Huge) {
        slot.clear_flag(SlotFlag::Huge);
        stats::dec(&stats.huge_pages);
    }

    if slot.test_flag(SlotFlag::Wb) {
        slot.clear_flag(SlotFlag::Wb);
        if let Some(backing) = backing {
            backing.free_block(slot.element());
        }
        slot.set_element(0);
        slot.set_size(0);
        stats::dec(&stats.pages_stored);
        return;
    }

    if slot.test_flag(SlotFlag::Same) {
        // No memory backs a same-filled page; just drop the flag.
        slot.clear_flag(SlotFlag::Same);
        slot.set_element(0);
        slot.set_size(0);
        stats::dec(&stats.same_pages);
        stats::dec(&stats.pages_stored);
        return;
    }

    let Some(entry) = slot.take_entry() else {
        return;
    };
    entry_put(&entry, rt, stats);
    slot.set_size(0);
    stats::dec(&stats.pages_stored);
}

/// Drop one slot reference to an entry, releasing the pool allocation on
/// the last one.
pub(crate) fn entry_put(entry: &Arc<Entry>, rt: &Runtime, stats: &DeviceStats) {
    if entry.put() == 0 {
        if let Some(dedup) = rt.dedup.as_ref() {
            dedup.remove(entry);
            stats::sub(&stats.meta_data_size, ENTRY_META_SIZE);
        }
        stats::sub(&stats.compr_data_size, entry.len() as u64);
        rt.pool.free(entry.handle());
    } else {
        stats::sub(&stats.dup_data_size, entry.len() as u64);
    }
}

/// Percentage of a page saved by storing `comp_len` bytes.
fn compression_savings(comp_len: usize) -> u32 {
    (100 * (PAGE_SIZE - comp_len) / PAGE_SIZE) as u32
}

/// Fill a page with a repeated machine word.
fn fill_page(page: &mut [u8], value: u64) {
    let bytes = value.to_ne_bytes();
    for chunk in page.chunks_exact_mut(8) {
        chunk.copy_from_slice(&bytes);
    }
}

/// If every machine-word lane of the page holds the same value, return it.
/// The last lane is checked first: pages that are *almost* uniform tend to
/// differ at the tail, and this rejects them after one comparison.
fn page_same_filled(page: &[u8]) -> Option<u64> {
    let mut lanes = page.chunks_exact(8);
    let first = u64::from_ne_bytes(lanes.next()?.try_into().ok()?);
    let last = page[page.len() - 8..].try_into().ok().map(u64::from_ne_bytes)?;
    if first != last {
        return None;
    }
    for lane in lanes {
        if u64::from_ne_bytes(lane.try_into().ok()?) != first {
            return None;
        }
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_filled_detects_uniform_pages() {
        let zeroes = vec![0u8; PAGE_SIZE];
        assert_eq!(page_same_filled(&zeroes), Some(0));

        let fives = vec![0x55u8; PAGE_SIZE];
        assert_eq!(page_same_filled(&fives), Some(0x5555_5555_5555_5555));
    }

    #[test]
    fn same_filled_rejects_nonuniform_pages() {
        let mut page = vec![0x55u8; PAGE_SIZE];
        page[PAGE_SIZE - 1] = 0x56;
        assert_eq!(page_same_filled(&page), None);

        let mut page = vec![0x55u8; PAGE_SIZE];
        page[100] = 0;
        assert_eq!(page_same_filled(&page), None);
    }

    #[test]
    fn fill_page_roundtrips_detection() {
        let mut page = vec![0u8; PAGE_SIZE];
        fill_page(&mut page, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(page_same_filled(&page), Some(0xDEAD_BEEF_CAFE_F00D));
    }

    #[test]
    fn valid_io_checks_alignment_and_bounds() {
        let disksize = 16 * PAGE_SIZE as u64;

        assert!(valid_io(disksize, 0, PAGE_SIZE as u64));
        assert!(valid_io(disksize, 8, PAGE_SIZE as u64));
        // Logical blocks are 1 KiB: sector 2 is aligned, sector 1 is not.
        assert!(valid_io(disksize, 2, LOGICAL_BLOCK_SIZE as u64));
        assert!(!valid_io(disksize, 1, PAGE_SIZE as u64));
        // Length must be a whole number of logical blocks.
        assert!(!valid_io(disksize, 0, 512));
        // Out of range.
        assert!(!valid_io(disksize, 16 * 8, PAGE_SIZE as u64));
        assert!(!valid_io(disksize, 15 * 8, 2 * PAGE_SIZE as u64));
        // Unconfigured device has no valid requests.
        assert!(!valid_io(0, 0, PAGE_SIZE as u64));
    }

    #[test]
    fn compression_savings_percentages() {
        assert_eq!(compression_savings(PAGE_SIZE), 0);
        assert_eq!(compression_savings(PAGE_SIZE / 2), 50);
        assert_eq!(compression_savings(1024), 75);
        assert_eq!(compression_savings(1000), 75);
        assert_eq!(compression_savings(64), 98);
    }
}
