//! # Backing Store
//!
//! Writeback target for evicted pages: an external block device addressed
//! as a flat grid of PAGE_SIZE blocks, plus the in-memory bitmap that
//! tracks which blocks are allocated. There is no on-device header; the
//! slot-to-block mapping lives only in the slot table, so evicted data
//! does not survive the device.
//!
//! Block 0 is never allocated — a zero block index doubles as "none"
//! throughout the writeback path.

mod bitmap;
mod file;

use std::path::Path;
use std::sync::Arc;

use eyre::Result;

use crate::config::PAGE_SIZE;
use crate::stats::{self, DeviceStats};

pub use bitmap::BlockBitmap;
pub use file::FileBackingDev;

/// Seam to the device that stores evicted pages.
pub trait BackingDev: Send + Sync {
    /// Usable size in PAGE_SIZE blocks.
    fn nr_pages(&self) -> u64;

    /// Read one block into a page-sized buffer.
    fn read_block(&self, blk: u64, dst: &mut [u8]) -> Result<()>;

    /// Write a contiguous run of blocks from a page-multiple buffer.
    fn write_blocks(&self, start_blk: u64, src: &[u8]) -> Result<()>;

    /// Flush pending writes to the device.
    fn sync(&self) -> Result<()>;
}

/// Backing device plus its allocation bitmap and counters.
pub struct BackingStore {
    dev: Arc<dyn BackingDev>,
    bitmap: BlockBitmap,
    stats: Arc<DeviceStats>,
    path: Option<String>,
}

impl BackingStore {
    /// Open a file-backed store at `path`.
    pub fn open(path: &Path, stats: Arc<DeviceStats>) -> Result<Self> {
        let dev = FileBackingDev::open(path)?;
        let mut store = Self::with_dev(Arc::new(dev), stats);
        store.path = Some(path.display().to_string());
        Ok(store)
    }

    /// Wrap an arbitrary backing device implementation.
    pub fn with_dev(dev: Arc<dyn BackingDev>, stats: Arc<DeviceStats>) -> Self {
        let bitmap = BlockBitmap::new(dev.nr_pages());
        Self {
            dev,
            bitmap,
            stats,
            path: None,
        }
    }

    pub fn nr_pages(&self) -> u64 {
        self.dev.nr_pages()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn bitmap(&self) -> &BlockBitmap {
        &self.bitmap
    }

    /// Claim a free block, or `None` when the device is full.
    pub fn alloc_block(&self) -> Option<u64> {
        let blk = self.bitmap.alloc()?;
        stats::inc(&self.stats.bd_count);
        Some(blk)
    }

    pub fn free_block(&self, blk: u64) {
        self.bitmap.free(blk);
        stats::dec(&self.stats.bd_count);
    }

    /// Read one evicted page back into memory.
    pub fn read_page(&self, blk: u64, dst: &mut [u8]) -> Result<()> {
        stats::inc(&self.stats.bd_reads);
        self.dev.read_block(blk, dst)
    }

    /// Submit one contiguous writeback batch. The caller owns the target
    /// blocks via the bitmap and reconciles slots after this returns.
    pub fn write_batch(&self, start_blk: u64, src: &[u8]) -> Result<()> {
        debug_assert_eq!(src.len() % PAGE_SIZE, 0);
        self.dev.write_blocks(start_blk, src)?;
        self.dev.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn store(pages: u64) -> (tempfile::TempDir, BackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        std::fs::write(&path, vec![0u8; (pages * PAGE_SIZE as u64) as usize]).unwrap();
        let stats = Arc::new(DeviceStats::new());
        let store = BackingStore::open(&path, stats).unwrap();
        (dir, store)
    }

    #[test]
    fn alloc_tracks_bd_count() {
        let (_dir, store) = store(8);

        let a = store.alloc_block().unwrap();
        let b = store.alloc_block().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.stats.bd_count.load(Ordering::Relaxed), 2);

        store.free_block(a);
        assert_eq!(store.stats.bd_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn batch_write_then_read_counts_reads() {
        let (_dir, store) = store(8);
        let start = store.alloc_block().unwrap();
        let _next = store.alloc_block().unwrap();

        let mut batch = vec![0u8; 2 * PAGE_SIZE];
        batch[..PAGE_SIZE].fill(0x11);
        batch[PAGE_SIZE..].fill(0x22);
        store.write_batch(start, &batch).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        store.read_page(start + 1, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0x22));
        assert_eq!(store.stats.bd_reads.load(Ordering::Relaxed), 1);
    }
}
