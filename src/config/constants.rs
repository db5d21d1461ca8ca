//! # Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_SHIFT (12, log2 of PAGE_SIZE)
//!       │
//!       ├─> SECTORS_PER_PAGE (8, PAGE_SIZE / SECTOR_SIZE)
//!       │
//!       ├─> SIZE_BITS (13)
//!       │     The per-slot flags word stores the object size in its low
//!       │     bits. Sizes span 0..=PAGE_SIZE inclusive, so one bit more
//!       │     than PAGE_SHIFT is needed.
//!       │
//!       └─> MAX_WRITEBACK_SIZE (32 staging pages, 128 KiB staging buffer)
//!
//! SIZE_BITS (13)
//!       │
//!       ├─> LOCK_BIT (13) and the flag bits above it
//!       │
//!       └─> IDLE_COUNT_SHIFT (24)
//!             Must leave room for every flag bit below it.
//!
//! LOGICAL_BLOCK_SIZE (1024)
//!       │
//!       └─> Request alignment unit. Smaller than PAGE_SIZE, so sub-page
//!           segments reach the read-modify-write path.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `SIZE_BITS` can represent `PAGE_SIZE` itself (huge pages)
//! 2. The idle counter field does not collide with any flag bit
//! 3. `LOGICAL_BLOCK_SIZE` divides `PAGE_SIZE`
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{PAGE_SIZE, MAX_WRITEBACK_SIZE};
//! ```

/// Size of one logical device page. All payload storage, the slot table,
/// and the backing-device block grid operate in units of this size.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Size of one block-layer sector.
pub const SECTOR_SIZE: usize = 512;

/// log2(SECTOR_SIZE).
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors per device page.
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;

/// Logical block size of the device. Requests must be aligned to this unit
/// and sized in multiples of it. It is intentionally smaller than
/// `PAGE_SIZE`: sub-page segments are served through the partial-IO
/// read-modify-write path.
pub const LOGICAL_BLOCK_SIZE: usize = 1024;

/// Sectors per logical block, the request alignment unit.
pub const SECTORS_PER_LOGICAL_BLOCK: u64 = (LOGICAL_BLOCK_SIZE / SECTOR_SIZE) as u64;

/// Bits used for the stored-object size in the low end of a slot's flags
/// word. Sizes range over 0..=PAGE_SIZE inclusive, hence PAGE_SHIFT + 1.
pub const SIZE_BITS: u32 = PAGE_SHIFT + 1;

/// Mask selecting the size field of a flags word.
pub const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;

/// Bit position of the per-slot spinlock within the flags word.
pub const LOCK_BIT: u32 = SIZE_BITS;

/// Bit position where the idle epoch counter starts.
pub const IDLE_COUNT_SHIFT: u32 = 24;

/// Width of the idle epoch counter.
pub const IDLE_COUNT_BITS: u32 = 3;

/// Saturation value of the idle epoch counter.
pub const IDLE_COUNT_MAX: u32 = (1 << IDLE_COUNT_BITS) - 1;

/// Mask selecting the idle counter field of a flags word.
pub const IDLE_COUNT_MASK: u64 = ((1 << IDLE_COUNT_BITS) - 1) << IDLE_COUNT_SHIFT;

/// Default minimum idle epoch count for idle-mode writeback when the
/// caller does not supply one.
pub const WB_IDLE_DEFAULT: u32 = 1;

/// Number of staging pages in the writeback batch buffer. One writeback
/// submission covers at most this many contiguous backing blocks.
pub const MAX_WRITEBACK_SIZE: usize = 32;

/// Default compression-savings threshold, in percent of PAGE_SIZE. A page
/// whose stored form saves less than this fraction is flagged as poorly
/// compressed and becomes an eviction candidate.
pub const DEFAULT_LOW_COMPRESS_RATIO: u32 = 75;

/// Per-stream compression workspace size. Worst-case compressed output of
/// a page is larger than the page itself.
pub const COMP_BUFFER_SIZE: usize = 2 * PAGE_SIZE;

const _: () = assert!(SIZE_MASK as usize >= PAGE_SIZE, "size field must hold PAGE_SIZE");
const _: () = assert!(IDLE_COUNT_SHIFT > LOCK_BIT + 6, "idle counter collides with flag bits");
const _: () = assert!(IDLE_COUNT_SHIFT + IDLE_COUNT_BITS <= 32, "idle counter exceeds word budget");
const _: () = assert!(PAGE_SIZE % LOGICAL_BLOCK_SIZE == 0, "logical block must divide page");
const _: () = assert!(LOGICAL_BLOCK_SIZE % SECTOR_SIZE == 0, "sector must divide logical block");
