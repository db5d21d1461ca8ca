//! Compressed payload reference.
//!
//! A slot that holds compressed bytes points at an [`Entry`]. With
//! deduplication enabled several slots may share one entry; the explicit
//! refcount decides when the underlying pool allocation is released.
//! Without deduplication an entry is never shared and the refcount stays
//! at one for its whole life.

use std::sync::atomic::{AtomicU32, Ordering};

use super::PoolHandle;

#[derive(Debug)]
pub struct Entry {
    handle: PoolHandle,
    len: u32,
    checksum: u32,
    refs: AtomicU32,
}

impl Entry {
    pub fn new(handle: PoolHandle, len: usize, checksum: u32) -> Self {
        Self {
            handle,
            len: len as u32,
            checksum,
            refs: AtomicU32::new(1),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Add a referring slot, unless the entry is already dying. An entry
    /// whose refcount reached zero is mid-teardown and must not be
    /// resurrected by the dedup index.
    pub fn try_get(&self) -> bool {
        let mut cur = self.refs.load(Ordering::Acquire);
        while cur != 0 {
            match self
                .refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
        false
    }

    /// Drop one reference; returns the number of references remaining.
    /// The caller frees the pool allocation when this reaches zero.
    pub fn put(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "entry refcount underflow");
        prev - 1
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}
