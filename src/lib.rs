//! # cramdisk — Compressed RAM Block Device
//!
//! A virtual block device whose backing store is host memory: every page
//! written to the device is compressed (or represented as a single
//! repeated word) and kept in a compact in-memory pool. Pages that
//! compress poorly or sit idle can be evicted to a real backing device to
//! free memory. Typical uses are swap and ephemeral storage where trading
//! CPU for memory is a win.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cramdisk::Registry;
//!
//! let device = Registry::global().add();
//! device.set_disksize(64 << 20)?;
//!
//! let page = vec![0x5A; 4096];
//! device.write(0, &page)?;
//!
//! let mut out = vec![0u8; 4096];
//! device.read(0, &mut out)?;
//! assert_eq!(out, page);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     Control surface (text attributes)       │
//! ├─────────────────────────────────────────────┤
//! │   Device lifecycle (configure / reset)      │
//! ├──────────────────────┬──────────────────────┤
//! │   I/O engine         │  Writeback policy    │
//! │   read/write/discard │  scan, batch, flush  │
//! ├──────────────────────┴──────────────────────┤
//! │   Slot table (per-page flags + spinlock)    │
//! ├──────────┬──────────────┬───────────────────┤
//! │  Pool    │  Codec       │  Backing store    │
//! │  (slab)  │  (lz4/snappy)│  (bitmap + file)  │
//! └──────────┴──────────────┴───────────────────┘
//! ```
//!
//! A page write is classified in order: same-filled pages store one
//! machine word; a dedup hit (optional) shares an existing entry;
//! everything else is compressed, falling back to uncompressed "huge"
//! storage when compression gains too little. Reads reverse the stored
//! form; evicted pages are fetched from the backing device transparently.
//!
//! ## Concurrency
//!
//! There is no global lock on the data path. Each slot carries a one-bit
//! spinlock inside its packed flags word; the device-wide init-lock is a
//! reader/writer lock taken for read by I/O and for write only by
//! configure/reset. Statistics are relaxed atomics.
//!
//! ## Module Overview
//!
//! - [`slots`]: per-page metadata table and lock discipline
//! - [`memory`]: pool seam and the default size-class slab pool
//! - [`codec`]: compression seam, algorithm registry, stream pool
//! - [`io`]: request validation and the read/write/discard pipeline
//! - [`backing`]: block bitmap and the writeback target device
//! - [`writeback`]: eviction policy and batch reconciliation
//! - [`device`]: lifecycle, registry, control surface
//! - [`dedup`]: optional content deduplication index

pub mod backing;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod device;
pub mod io;
pub mod memory;
pub mod slots;
pub mod stats;
pub mod writeback;

pub use backing::{BackingDev, BackingStore};
pub use codec::Codec;
pub use device::{Device, DeviceHandle, Registry};
pub use io::BlockRequest;
pub use memory::{AllocMode, PagePool, PoolHandle, SlabPool};
pub use stats::DeviceStats;
pub use writeback::{parse_writeback, WritebackMode};
