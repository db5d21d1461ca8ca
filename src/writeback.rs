//! # Writeback
//!
//! Control-plane eviction of stored pages to the backing device. A pass
//! walks the slot table, stages eligible pages into a contiguous staging
//! buffer, and submits them in batches of consecutive backing blocks.
//!
//! ## Eligibility
//!
//! Every candidate must be allocated, poorly compressed (`COMPRESS_LOW`),
//! not already evicted, and not under writeback. Idle mode additionally
//! requires `IDLE` with an epoch count at or above the requested minimum;
//! huge mode requires `HUGE`.
//!
//! ## The repopulation race
//!
//! Between staging a page and reconciling the batch, the slot lock is not
//! held: the slot can be freed or rewritten while the batch is in flight.
//! Two marks close the race. `UNDER_WB` makes the slot untouchable for
//! idle marking and for other writeback passes, and hands ownership of
//! the payload to the batch. `IDLE` is set at staging time; any write
//! that repopulates the slot clears it, so reconciliation can tell a
//! surviving payload (`IDLE` still set) from a replaced one and leaves
//! the fresh data alone, returning the backing block instead.
//!
//! ## Failure handling
//!
//! A failed staging read or batch write rolls the affected slots back:
//! `UNDER_WB` and the idle state are cleared and the claimed blocks are
//! returned. Data stays in memory; the pass surfaces the first fatal
//! error after flushing what it already staged.

use std::sync::atomic::Ordering;

use eyre::{bail, ensure, eyre, Result};
use log::{error, info};
use smallvec::SmallVec;

use crate::backing::BackingStore;
use crate::config::{
    IDLE_COUNT_MAX, MAX_WRITEBACK_SIZE, PAGE_SIZE, WB_IDLE_DEFAULT,
};
use crate::device::{runtime, Device, Runtime};
use crate::io::{free_slot, IoCtx};
use crate::slots::SlotFlag;
use crate::stats::{self, DeviceStats};

/// What a writeback pass evicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackMode {
    /// Evict uncompressed (huge) pages.
    Huge,
    /// Evict idle, poorly compressed pages.
    Idle {
        /// Cap on pages written this pass.
        wb_max: u64,
        /// Minimum idle epoch count a slot must have survived.
        wb_idle_min: u32,
    },
}

/// Parse the textual writeback command: `huge`, `idle`,
/// `idle <max>`, or `idle <max> <min>`.
pub fn parse_writeback(input: &str) -> Result<WritebackMode> {
    let mut args = input.split_whitespace();
    let mode = match args.next() {
        Some("huge") => WritebackMode::Huge,
        Some("idle") => {
            let wb_max = args
                .next()
                .map(|s| s.parse::<u64>())
                .transpose()
                .map_err(|e| eyre!("bad writeback page cap: {e}"))?
                .unwrap_or(u64::MAX);
            let wb_idle_min = args
                .next()
                .map(|s| s.parse::<u32>())
                .transpose()
                .map_err(|e| eyre!("bad writeback idle minimum: {e}"))?
                .unwrap_or(WB_IDLE_DEFAULT)
                .min(IDLE_COUNT_MAX);
            WritebackMode::Idle {
                wb_max,
                wb_idle_min,
            }
        }
        _ => bail!("writeback mode must be \"huge\" or \"idle\""),
    };
    ensure!(args.next().is_none(), "trailing writeback arguments");
    Ok(mode)
}

impl Device {
    /// Run one writeback pass. Returns the number of pages evicted, or
    /// the first fatal error (cancellation, exhausted budget, full
    /// backing device) after flushing what was already staged.
    pub fn writeback(&self, mode: WritebackMode) -> Result<u64> {
        let inner = self.inner.read();
        let rt = runtime(&inner)?;
        let backing = inner
            .backing
            .as_ref()
            .ok_or_else(|| eyre!("no backing device configured"))?;
        // Serializes concurrent passes; they share one staging buffer.
        let mut staging = self.staging.lock();

        let ctx = IoCtx {
            dev: self,
            rt,
            backing: Some(backing),
            limit_pages: inner.limit_pages,
        };
        let wb_max = match mode {
            WritebackMode::Idle { wb_max, .. } => wb_max,
            WritebackMode::Huge => u64::MAX,
        };

        let mut batch: SmallVec<[u64; MAX_WRITEBACK_SIZE]> = SmallVec::new();
        let mut start_blk = 0u64;
        let mut held_blk: Option<u64> = None;
        let mut written = 0u64;
        let mut flushes = 0u64;
        let mut fatal: Option<eyre::Report> = None;

        for index in 0..rt.nr_pages {
            if self.wb_cancel.swap(false, Ordering::AcqRel) {
                info!("cram{}: writeback cancelled", self.id());
                fatal = Some(eyre!("writeback interrupted"));
                break;
            }

            {
                let limit = self.wb_limit.lock();
                if limit.enable && limit.budget == 0 {
                    fatal = Some(eyre!("writeback budget exhausted"));
                    break;
                }
            }

            if held_blk.is_none() {
                match backing.alloc_block() {
                    Some(blk) => {
                        if batch.is_empty() {
                            start_blk = blk;
                        }
                        held_blk = Some(blk);
                    }
                    None => {
                        fatal = Some(eyre!("backing device full"));
                        break;
                    }
                }
            }
            let blk = held_blk.expect("allocated above");

            if batch.len() >= MAX_WRITEBACK_SIZE || start_blk + batch.len() as u64 != blk {
                written += flush_batch(self, rt, backing, start_blk, &batch, &staging);
                flushes += 1;
                batch.clear();
                start_blk = blk;
            }

            if written >= wb_max {
                break;
            }

            {
                let slot = rt.table.lock(index);
                if !slot.allocated() {
                    continue;
                }
                if slot.test_flag(SlotFlag::Wb)
                    || !slot.test_flag(SlotFlag::CompressLow)
                    || slot.test_flag(SlotFlag::UnderWb)
                {
                    continue;
                }
                match mode {
                    WritebackMode::Idle { wb_idle_min, .. } => {
                        if !slot.test_flag(SlotFlag::Idle) || slot.idle_count() < wb_idle_min {
                            continue;
                        }
                    }
                    WritebackMode::Huge => {
                        if !slot.test_flag(SlotFlag::Huge) {
                            continue;
                        }
                    }
                }

                // UNDER_WB transfers payload ownership to this batch.
                // IDLE is set alongside it: a write that repopulates the
                // slot while the batch is in flight will clear IDLE, which
                // is how reconciliation recognizes the replacement.
                slot.set_flag(SlotFlag::UnderWb);
                slot.set_flag(SlotFlag::Idle);
            }

            let page = &mut staging[batch.len() * PAGE_SIZE..(batch.len() + 1) * PAGE_SIZE];
            if ctx.read_page(index, page, false).is_err() {
                let slot = rt.table.lock(index);
                slot.clear_flag(SlotFlag::UnderWb);
                slot.clear_flag(SlotFlag::Idle);
                slot.clear_idle_count();
                continue;
            }

            batch.push(index);
            held_blk = None;
        }

        if !batch.is_empty() {
            written += flush_batch(self, rt, backing, start_blk, &batch, &staging);
            flushes += 1;
        }
        if let Some(blk) = held_blk {
            backing.free_block(blk);
        }

        info!(
            "cram{}: writeback finished, {} pages in {} batches",
            self.id(),
            written,
            flushes
        );
        match fatal {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

/// Submit one contiguous batch and reconcile its slots.
///
/// Returns the number of slots that actually transitioned to `WB`. On a
/// write error every slot is rolled back and its block returned; the
/// batch then contributed nothing.
fn flush_batch(
    dev: &Device,
    rt: &Runtime,
    backing: &BackingStore,
    start_blk: u64,
    batch: &[u64],
    staging: &[u8],
) -> u64 {
    if batch.is_empty() {
        return 0;
    }
    let stats: &DeviceStats = &dev.stats;

    if let Err(e) = backing.write_batch(start_blk, &staging[..batch.len() * PAGE_SIZE]) {
        error!("writeback batch at block {start_blk} failed: {e}");
        for (i, &index) in batch.iter().enumerate() {
            let slot = rt.table.lock(index);
            slot.clear_flag(SlotFlag::UnderWb);
            slot.clear_flag(SlotFlag::Idle);
            slot.clear_idle_count();
            drop(slot);
            backing.free_block(start_blk + i as u64);
        }
        return 0;
    }

    let mut done = 0;
    for (i, &index) in batch.iter().enumerate() {
        stats::inc(&stats.bd_writes);
        let blk = start_blk + i as u64;

        let mut slot = rt.table.lock(index);
        // The slot lock was dropped while the write was in flight. A
        // freed slot is no longer allocated; a repopulated one lost its
        // IDLE mark. Either way the staged copy is stale — keep the
        // in-memory data and give the block back.
        if !slot.allocated() || !slot.test_flag(SlotFlag::Idle) {
            slot.clear_flag(SlotFlag::UnderWb);
            slot.clear_flag(SlotFlag::Idle);
            slot.clear_idle_count();
            drop(slot);
            backing.free_block(blk);
            continue;
        }

        free_slot(&mut slot, rt, Some(backing), stats);
        slot.clear_flag(SlotFlag::UnderWb);
        slot.set_flag(SlotFlag::Wb);
        slot.set_element(blk);
        stats::inc(&stats.pages_stored);

        {
            let mut limit = dev.wb_limit.lock();
            if limit.enable && limit.budget > 0 {
                limit.budget -= (PAGE_SIZE >> 12) as u64;
            }
        }
        drop(slot);
        done += 1;
    }
    done
}
