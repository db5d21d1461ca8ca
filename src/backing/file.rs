//! Memory-mapped backing device.
//!
//! Maps the backing file (a block device node or a regular file) and
//! serves block reads and contiguous batch writes by memcpy. The mapping
//! is shared: concurrency safety rests on the block-ownership protocol,
//! not on a lock here.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapRaw;

use crate::config::PAGE_SIZE;

use super::BackingDev;

pub struct FileBackingDev {
    map: MmapRaw,
    nr_pages: u64,
}

impl FileBackingDev {
    /// Open an existing file or device node for writeback use. The usable
    /// size is its current length rounded down to whole pages.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("cannot open backing device {}", path.display()))?;
        let len = file
            .metadata()
            .wrap_err("cannot stat backing device")?
            .len();
        let nr_pages = len / PAGE_SIZE as u64;
        ensure!(nr_pages >= 2, "backing device too small: {len} bytes");

        let map = MmapRaw::map_raw(&file).wrap_err("cannot map backing device")?;
        Ok(Self { map, nr_pages })
    }

    fn check_range(&self, start_blk: u64, nr_blocks: u64) -> Result<()> {
        ensure!(
            start_blk
                .checked_add(nr_blocks)
                .is_some_and(|end| end <= self.nr_pages),
            "backing block range {start_blk}+{nr_blocks} out of bounds ({} blocks)",
            self.nr_pages
        );
        Ok(())
    }
}

impl BackingDev for FileBackingDev {
    fn nr_pages(&self) -> u64 {
        self.nr_pages
    }

    fn read_block(&self, blk: u64, dst: &mut [u8]) -> Result<()> {
        ensure!(dst.len() == PAGE_SIZE, "backing read requires a full page");
        self.check_range(blk, 1)?;
        // SAFETY: the range was bounds-checked against the mapping. A
        // block is referenced by at most one slot and its bitmap bit stays
        // set while a write is in flight, so a concurrent writer never
        // targets the block being read.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(blk as usize * PAGE_SIZE),
                dst.as_mut_ptr(),
                PAGE_SIZE,
            );
        }
        Ok(())
    }

    fn write_blocks(&self, start_blk: u64, src: &[u8]) -> Result<()> {
        ensure!(
            !src.is_empty() && src.len() % PAGE_SIZE == 0,
            "backing write must cover whole pages"
        );
        self.check_range(start_blk, (src.len() / PAGE_SIZE) as u64)?;
        // SAFETY: bounds-checked above; the target blocks were claimed in
        // the bitmap by this writeback batch, so nothing else reads or
        // writes them until reconciliation publishes the slots.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.map.as_mut_ptr().add(start_blk as usize * PAGE_SIZE),
                src.len(),
            );
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.map.flush().wrap_err("backing device flush failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_backing(pages: u64) -> (tempfile::TempDir, FileBackingDev) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        std::fs::write(&path, vec![0u8; (pages * PAGE_SIZE as u64) as usize]).unwrap();
        let dev = FileBackingDev::open(&path).unwrap();
        (dir, dev)
    }

    #[test]
    fn write_then_read_blocks() {
        let (_dir, dev) = temp_backing(8);
        let data = vec![0xABu8; 2 * PAGE_SIZE];

        dev.write_blocks(3, &data).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        dev.read_block(4, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAB));

        dev.read_block(2, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_out_of_bounds() {
        let (_dir, dev) = temp_backing(4);
        let mut page = vec![0u8; PAGE_SIZE];

        assert!(dev.read_block(4, &mut page).is_err());
        assert!(dev.write_blocks(3, &vec![0u8; 2 * PAGE_SIZE]).is_err());
    }

    #[test]
    fn size_rounds_down_to_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0u8; 3 * PAGE_SIZE + 100]).unwrap();

        let dev = FileBackingDev::open(&path).unwrap();
        assert_eq!(dev.nr_pages(), 3);
    }
}
