//! # Compressed Payload Pool
//!
//! The device stores compressed pages through the [`PagePool`] seam; the
//! default implementation is a size-class slab allocator.
//!
//! ## Size Classes
//!
//! Objects are rounded up to the next 64-byte class (64, 128, ..., 4096).
//! Each class carves its objects out of 16 KiB chunks, so small payloads
//! pack densely and accounting stays in whole pages:
//!
//! ```text
//! class 64:    256 objects / chunk
//! class 2048:    8 objects / chunk
//! class 4096:    4 objects / chunk
//! ```
//!
//! ## Handles
//!
//! An allocation is identified by an opaque [`PoolHandle`] that encodes
//! (class, chunk, object). Mapping a handle hands the caller a closure
//! over the object's bytes while the class lock is held; callers keep the
//! mapped section short (a memcpy or one page decompression).
//!
//! ## Compaction
//!
//! Freeing never returns chunk memory by itself. `compact` sweeps each
//! class and drops chunks with no live objects, reporting how many pages
//! were reclaimed.
//!
//! ## Blocking
//!
//! [`AllocMode`] distinguishes the caller's tolerance for stalling. The
//! slab pool itself never blocks; the mode matters for pool
//! implementations that may reclaim, and the write path is structured to
//! release its compression stream before a `MayBlock` attempt.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PAGE_SIZE;

/// Allocation class granularity.
const CLASS_STEP: usize = 64;
/// Number of size classes (64-byte steps up to PAGE_SIZE).
const NUM_CLASSES: usize = PAGE_SIZE / CLASS_STEP;
/// Backing chunk size per class, in bytes.
const CHUNK_BYTES: usize = 4 * PAGE_SIZE;
/// Pages accounted per chunk.
const CHUNK_PAGES: u64 = (CHUNK_BYTES / PAGE_SIZE) as u64;

/// Objects a full-page class packs into one chunk.
const FULL_PAGE_OBJS: usize = CHUNK_BYTES / PAGE_SIZE;

/// Payloads at or above this size gain too little from compression to be
/// worth a compressed class; the device stores them as full pages. The
/// threshold is the smallest class that packs no more objects into a
/// chunk than the full-page class does: from there on, chunk slack eats
/// the entire compression win.
const HUGE_CLASS_SIZE: usize =
    (CHUNK_BYTES / (FULL_PAGE_OBJS + 1) / CLASS_STEP + 1) * CLASS_STEP;

/// Opaque reference to one pool allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(u64);

impl PoolHandle {
    fn pack(class: usize, chunk: u32, obj: u16) -> Self {
        Self((class as u64) << 48 | (chunk as u64) << 16 | obj as u64)
    }

    fn unpack(self) -> (usize, u32, u16) {
        (
            (self.0 >> 48) as usize,
            (self.0 >> 16) as u32,
            self.0 as u16,
        )
    }
}

/// Whether an allocation is allowed to stall on reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Fail instead of stalling. Used while a compression stream is
    /// borrowed.
    NoWait,
    /// The caller tolerates a stall; it holds no stream and no slot lock.
    MayBlock,
}

/// Seam to the compact allocator holding compressed payloads.
pub trait PagePool: Send + Sync {
    /// Allocate `len` bytes; `None` when the pool cannot satisfy it.
    fn alloc(&self, len: usize, mode: AllocMode) -> Option<PoolHandle>;

    /// Return an allocation to the pool.
    fn free(&self, handle: PoolHandle);

    /// Run `f` over the allocation's bytes, read-only. The slice may be
    /// longer than the requested length (class rounding).
    fn map_ro(&self, handle: PoolHandle, f: &mut dyn FnMut(&[u8]));

    /// Run `f` over the allocation's bytes, writable.
    fn map_wo(&self, handle: PoolHandle, f: &mut dyn FnMut(&mut [u8]));

    /// Memory pages currently backing the pool.
    fn total_pages(&self) -> u64;

    /// Reclaim what fragmentation allows; returns pages released.
    fn compact(&self) -> u64;

    /// Threshold above which compression is not worth storing.
    fn huge_class_size(&self) -> usize {
        HUGE_CLASS_SIZE
    }
}

struct Chunk {
    data: Box<[u8]>,
    live: u32,
}

struct ClassState {
    chunks: Vec<Chunk>,
    free: Vec<(u32, u16)>,
}

impl ClassState {
    const fn new() -> Self {
        Self {
            chunks: Vec::new(),
            free: Vec::new(),
        }
    }
}

/// Default size-class slab pool.
pub struct SlabPool {
    classes: Box<[Mutex<ClassState>]>,
    total_pages: AtomicU64,
    /// Optional hard cap on backing pages; allocation fails beyond it.
    max_pages: Option<u64>,
}

impl SlabPool {
    pub fn new() -> Self {
        Self::with_max_pages(None)
    }

    /// A pool that refuses to grow beyond `max` pages. Used by tests to
    /// exercise the out-of-memory paths.
    pub fn with_max_pages(max: Option<u64>) -> Self {
        let classes = (0..NUM_CLASSES)
            .map(|_| Mutex::new(ClassState::new()))
            .collect::<Vec<_>>();
        Self {
            classes: classes.into_boxed_slice(),
            total_pages: AtomicU64::new(0),
            max_pages: max,
        }
    }

    fn class_index(len: usize) -> usize {
        debug_assert!(len >= 1 && len <= PAGE_SIZE);
        (len + CLASS_STEP - 1) / CLASS_STEP - 1
    }

    fn class_size(class: usize) -> usize {
        (class + 1) * CLASS_STEP
    }

    fn objs_per_chunk(class: usize) -> u16 {
        (CHUNK_BYTES / Self::class_size(class)) as u16
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePool for SlabPool {
    fn alloc(&self, len: usize, _mode: AllocMode) -> Option<PoolHandle> {
        if len == 0 || len > PAGE_SIZE {
            return None;
        }
        let class = Self::class_index(len);
        let mut state = self.classes[class].lock();

        if let Some((chunk, obj)) = state.free.pop() {
            state.chunks[chunk as usize].live += 1;
            return Some(PoolHandle::pack(class, chunk, obj));
        }

        if let Some(max) = self.max_pages {
            if self.total_pages.load(Ordering::Relaxed) + CHUNK_PAGES > max {
                return None;
            }
        }

        let chunk_idx = state.chunks.len() as u32;
        state.chunks.push(Chunk {
            data: vec![0u8; CHUNK_BYTES].into_boxed_slice(),
            live: 0,
        });
        self.total_pages.fetch_add(CHUNK_PAGES, Ordering::Relaxed);

        for obj in (1..Self::objs_per_chunk(class)).rev() {
            state.free.push((chunk_idx, obj));
        }
        state.chunks[chunk_idx as usize].live = 1;
        Some(PoolHandle::pack(class, chunk_idx, 0))
    }

    fn free(&self, handle: PoolHandle) {
        let (class, chunk, obj) = handle.unpack();
        let mut state = self.classes[class].lock();
        debug_assert!(state.chunks[chunk as usize].live > 0);
        state.chunks[chunk as usize].live -= 1;
        state.free.push((chunk, obj));
    }

    fn map_ro(&self, handle: PoolHandle, f: &mut dyn FnMut(&[u8])) {
        let (class, chunk, obj) = handle.unpack();
        let size = Self::class_size(class);
        let state = self.classes[class].lock();
        let off = obj as usize * size;
        f(&state.chunks[chunk as usize].data[off..off + size]);
    }

    fn map_wo(&self, handle: PoolHandle, f: &mut dyn FnMut(&mut [u8])) {
        let (class, chunk, obj) = handle.unpack();
        let size = Self::class_size(class);
        let mut state = self.classes[class].lock();
        let off = obj as usize * size;
        f(&mut state.chunks[chunk as usize].data[off..off + size]);
    }

    fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Relaxed)
    }

    fn compact(&self) -> u64 {
        let mut reclaimed = 0;
        for class in self.classes.iter() {
            let mut state = class.lock();
            let mut dropped = Vec::new();
            for (i, chunk) in state.chunks.iter_mut().enumerate() {
                if chunk.live == 0 && !chunk.data.is_empty() {
                    chunk.data = Box::default();
                    dropped.push(i as u32);
                    reclaimed += CHUNK_PAGES;
                }
            }
            if !dropped.is_empty() {
                state.free.retain(|(chunk, _)| !dropped.contains(chunk));
            }
        }
        self.total_pages.fetch_sub(reclaimed, Ordering::Relaxed);
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_map_roundtrip() {
        let pool = SlabPool::new();
        let handle = pool.alloc(100, AllocMode::NoWait).unwrap();

        pool.map_wo(handle, &mut |dst| {
            dst[..4].copy_from_slice(b"abcd");
        });
        let mut out = [0u8; 4];
        pool.map_ro(handle, &mut |src| {
            out.copy_from_slice(&src[..4]);
        });

        assert_eq!(&out, b"abcd");
        pool.free(handle);
    }

    #[test]
    fn mapped_slice_covers_class_size() {
        let pool = SlabPool::new();
        let handle = pool.alloc(100, AllocMode::NoWait).unwrap();

        let mut len = 0;
        pool.map_ro(handle, &mut |src| len = src.len());

        assert_eq!(len, 128);
        pool.free(handle);
    }

    #[test]
    fn free_slots_are_reused_within_a_chunk() {
        let pool = SlabPool::new();
        let a = pool.alloc(64, AllocMode::NoWait).unwrap();
        let pages_after_first = pool.total_pages();

        pool.free(a);
        let b = pool.alloc(64, AllocMode::NoWait).unwrap();

        assert_eq!(pool.total_pages(), pages_after_first);
        pool.free(b);
    }

    #[test]
    fn max_pages_bounds_growth() {
        let pool = SlabPool::with_max_pages(Some(CHUNK_PAGES));

        let a = pool.alloc(PAGE_SIZE, AllocMode::NoWait).unwrap();
        // Same class still has free objects in the first chunk.
        let b = pool.alloc(PAGE_SIZE, AllocMode::NoWait).unwrap();
        // A different class would need a second chunk.
        assert!(pool.alloc(64, AllocMode::MayBlock).is_none());

        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn compact_releases_empty_chunks() {
        let pool = SlabPool::new();
        let handles: Vec<_> = (0..8)
            .map(|_| pool.alloc(PAGE_SIZE, AllocMode::NoWait).unwrap())
            .collect();
        assert_eq!(pool.total_pages(), 2 * CHUNK_PAGES);

        for h in handles {
            pool.free(h);
        }
        let reclaimed = pool.compact();

        assert_eq!(reclaimed, 2 * CHUNK_PAGES);
        assert_eq!(pool.total_pages(), 0);
    }

    #[test]
    fn compact_keeps_live_chunks() {
        let pool = SlabPool::new();
        let keep = pool.alloc(256, AllocMode::NoWait).unwrap();
        pool.map_wo(keep, &mut |dst| dst[0] = 7);

        assert_eq!(pool.compact(), 0);

        let mut v = 0;
        pool.map_ro(keep, &mut |src| v = src[0]);
        assert_eq!(v, 7);
        pool.free(keep);
    }

    #[test]
    fn class_rounding() {
        assert_eq!(SlabPool::class_index(1), 0);
        assert_eq!(SlabPool::class_index(64), 0);
        assert_eq!(SlabPool::class_index(65), 1);
        assert_eq!(SlabPool::class_index(PAGE_SIZE), NUM_CLASSES - 1);
    }

    #[test]
    fn huge_class_size_derived_from_chunk_packing() {
        assert_eq!(HUGE_CLASS_SIZE % CLASS_STEP, 0);
        assert_eq!(HUGE_CLASS_SIZE, 3328);

        // The threshold class packs no more objects per chunk than the
        // full-page class; the class one step below still packs more.
        let at = SlabPool::class_index(HUGE_CLASS_SIZE);
        assert_eq!(SlabPool::objs_per_chunk(at) as usize, FULL_PAGE_OBJS);
        assert!(SlabPool::objs_per_chunk(at - 1) as usize > FULL_PAGE_OBJS);

        let pool = SlabPool::new();
        assert_eq!(pool.huge_class_size(), HUGE_CLASS_SIZE);
    }
}
