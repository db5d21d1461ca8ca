//! # Content Deduplication Index
//!
//! Optional side structure mapping a page checksum to the entries already
//! storing that content. The index never owns page data; it holds extra
//! references to entries whose lifetime is still driven by slot refcounts.
//!
//! A checksum match is only a candidate: the write path verifies it with
//! a byte comparison of the decompressed candidate before sharing the
//! entry, so checksum collisions cost a verification copy and nothing
//! else.

use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::memory::Entry;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum of an uncompressed page, the dedup key.
pub fn page_checksum(page: &[u8]) -> u32 {
    CRC32.checksum(page)
}

/// Approximate per-entry metadata footprint, for the `meta_data_size`
/// counter.
pub const ENTRY_META_SIZE: u64 = std::mem::size_of::<Entry>() as u64;

#[derive(Default)]
pub struct DedupIndex {
    buckets: Mutex<HashMap<u32, Vec<Arc<Entry>>>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for an entry with matching content. `verify` decides whether a
    /// checksum candidate really matches, by decompressing and comparing.
    /// On a hit the entry's refcount is raised for the caller.
    ///
    /// The bucket lock is held across verification: a dying entry removes
    /// itself from the index before its pool handle is freed, so any
    /// candidate seen here is still mapped. The refcount bump itself can
    /// still lose to a concurrent final release, which `try_get` detects.
    pub fn find(
        &self,
        checksum: u32,
        verify: &mut dyn FnMut(&Entry) -> bool,
    ) -> Option<Arc<Entry>> {
        let buckets = self.buckets.lock();
        let candidates = buckets.get(&checksum)?;
        for entry in candidates {
            if verify(entry) && entry.try_get() {
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    /// Register a freshly stored entry under its checksum.
    pub fn insert(&self, entry: &Arc<Entry>) {
        self.buckets
            .lock()
            .entry(entry.checksum())
            .or_default()
            .push(Arc::clone(entry));
    }

    /// Drop a dying entry from the index. Called when the last slot
    /// reference goes away.
    pub fn remove(&self, entry: &Entry) {
        let mut buckets = self.buckets.lock();
        if let Some(candidates) = buckets.get_mut(&entry.checksum()) {
            candidates.retain(|e| e.handle() != entry.handle());
            if candidates.is_empty() {
                buckets.remove(&entry.checksum());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}
