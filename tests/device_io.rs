//! # Block I/O Integration Tests
//!
//! Exercises the data path end to end through the public request surface:
//!
//! 1. Same-filled pages
//!    - Stored as a single word, counted in same_pages
//!    - Round-trip for arbitrary fill constants
//!
//! 2. Compressed and huge pages
//!    - Round-trip of compressible and incompressible data
//!    - Huge accounting for incompressible pages
//!
//! 3. Partial I/O
//!    - Sub-page writes patch exactly the requested window
//!    - Sub-page reads return the requested window
//!
//! 4. Validation
//!    - Misaligned and out-of-range requests fail and count invalid_io
//!
//! 5. Discard and write-zeroes
//!    - Discarded pages read back as zeros
//!    - Partially covered pages are skipped by discard, zeroed by
//!      write-zeroes

use std::sync::atomic::Ordering;

use cramdisk::config::PAGE_SIZE;
use cramdisk::{BlockRequest, Device};

const SECTORS_PER_PAGE: u64 = 8;

fn configured_device(pages: u64) -> std::sync::Arc<Device> {
    let dev = Device::new(0);
    dev.set_disksize(pages * PAGE_SIZE as u64).unwrap();
    dev
}

/// Deterministic pseudo-random page; incompressible for any real codec.
fn random_page(seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut page = vec![0u8; PAGE_SIZE];
    for b in page.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *b = state as u8;
    }
    page
}

/// Half random, half zeros: compresses, but saves less than the default
/// 75% threshold.
fn low_ratio_page(seed: u64) -> Vec<u8> {
    let mut page = random_page(seed);
    page[2000..].fill(0);
    page
}

#[test]
fn same_filled_page_roundtrip() {
    let dev = configured_device(16);
    let page = vec![0x5Au8; PAGE_SIZE];

    dev.write(0, &page).unwrap();

    assert_eq!(dev.stats().same_pages.load(Ordering::Relaxed), 1);
    assert_eq!(dev.stats().pages_stored.load(Ordering::Relaxed), 1);

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, page);
}

#[test]
fn same_fill_idempotent_over_constants() {
    let dev = configured_device(16);

    for (i, byte) in [0x00u8, 0xFF, 0x5A, 0xA5, 0x01].into_iter().enumerate() {
        let sector = i as u64 * SECTORS_PER_PAGE;
        let page = vec![byte; PAGE_SIZE];
        dev.write(sector, &page).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        dev.read(sector, &mut out).unwrap();
        assert_eq!(out, page, "fill byte {byte:#x}");
    }

    assert_eq!(dev.stats().same_pages.load(Ordering::Relaxed), 5);
}

#[test]
fn compressible_page_roundtrip() {
    let dev = configured_device(16);
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, b) in page.iter_mut().enumerate() {
        *b = (i / 64) as u8;
    }

    dev.write(8, &page).unwrap();

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(8, &mut out).unwrap();
    assert_eq!(out, page);
    assert_eq!(dev.stats().same_pages.load(Ordering::Relaxed), 0);
    assert!(dev.stats().compr_data_size.load(Ordering::Relaxed) > 0);
    assert!(dev.stats().compr_data_size.load(Ordering::Relaxed) < PAGE_SIZE as u64);
}

#[test]
fn incompressible_page_stored_huge() {
    let dev = configured_device(16);
    let page = random_page(42);

    dev.write(0, &page).unwrap();

    assert_eq!(dev.stats().huge_pages.load(Ordering::Relaxed), 1);
    // Huge pages save nothing, so they are low-ratio candidates too.
    assert_eq!(dev.stats().lowratio_pages.load(Ordering::Relaxed), 1);

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, page);
}

#[test]
fn overwrite_replaces_previous_contents() {
    let dev = configured_device(16);

    dev.write(0, &vec![0x11u8; PAGE_SIZE]).unwrap();
    dev.write(0, &random_page(7)).unwrap();
    dev.write(0, &low_ratio_page(9)).unwrap();

    assert_eq!(dev.stats().pages_stored.load(Ordering::Relaxed), 1);
    assert_eq!(dev.stats().same_pages.load(Ordering::Relaxed), 0);
    assert_eq!(dev.stats().huge_pages.load(Ordering::Relaxed), 0);

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, low_ratio_page(9));
}

#[test]
fn partial_write_patches_exact_window() {
    let dev = configured_device(16);
    let base = low_ratio_page(3);
    dev.write(8, &base).unwrap();

    // Offset 1024, length 2048 within the second page.
    let patch = vec![0xEEu8; 2048];
    dev.write(8 + 2, &patch).unwrap();

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(8, &mut out).unwrap();

    assert_eq!(&out[..1024], &base[..1024]);
    assert_eq!(&out[1024..3072], &patch[..]);
    assert_eq!(&out[3072..], &base[3072..]);
}

#[test]
fn partial_read_returns_window() {
    let dev = configured_device(16);
    let page = low_ratio_page(11);
    dev.write(0, &page).unwrap();

    let mut window = vec![0u8; 1024];
    dev.read(4, &mut window).unwrap();

    assert_eq!(&window[..], &page[2048..3072]);
}

#[test]
fn multi_page_request_spans_slots() {
    let dev = configured_device(16);
    let mut data = Vec::new();
    for seed in 0..3 {
        data.extend_from_slice(&low_ratio_page(seed + 100));
    }

    dev.write(8, &data).unwrap();

    let mut out = vec![0u8; 3 * PAGE_SIZE];
    dev.read(8, &mut out).unwrap();
    assert_eq!(out, data);
    assert_eq!(dev.stats().pages_stored.load(Ordering::Relaxed), 3);
}

#[test]
fn unwritten_pages_read_zeros() {
    let dev = configured_device(16);

    let mut out = vec![0xFFu8; PAGE_SIZE];
    dev.read(5 * SECTORS_PER_PAGE, &mut out).unwrap();

    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn misaligned_request_counts_invalid_io() {
    let dev = configured_device(16);
    dev.write(0, &vec![0x42u8; PAGE_SIZE]).unwrap();

    // Sector 1 is inside a logical block.
    let mut buf = vec![0u8; PAGE_SIZE];
    assert!(dev.read(1, &mut buf).is_err());
    assert_eq!(dev.stats().invalid_io.load(Ordering::Relaxed), 1);

    assert!(dev.write(1, &buf).is_err());
    assert_eq!(dev.stats().invalid_io.load(Ordering::Relaxed), 2);

    // Unaligned length.
    let mut small = vec![0u8; 512];
    assert!(dev.read(0, &mut small).is_err());
    assert_eq!(dev.stats().invalid_io.load(Ordering::Relaxed), 3);

    // Data unchanged by the failures.
    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0x42));
}

#[test]
fn out_of_bounds_request_fails() {
    let dev = configured_device(4);
    let mut buf = vec![0u8; PAGE_SIZE];

    assert!(dev.read(4 * SECTORS_PER_PAGE, &mut buf).is_err());
    assert!(dev
        .write(3 * SECTORS_PER_PAGE, &vec![0u8; 2 * PAGE_SIZE])
        .is_err());
    assert_eq!(dev.stats().invalid_io.load(Ordering::Relaxed), 2);
}

#[test]
fn requests_fail_before_configuration() {
    let dev = Device::new(0);
    let mut buf = vec![0u8; PAGE_SIZE];

    assert!(dev.read(0, &mut buf).is_err());
    assert_eq!(dev.stats().invalid_io.load(Ordering::Relaxed), 1);
}

#[test]
fn discard_then_read_yields_zeros() {
    let dev = configured_device(16);
    dev.write(0, &low_ratio_page(5)).unwrap();
    let stored_before = dev.stats().pages_stored.load(Ordering::Relaxed);

    dev.discard(0, PAGE_SIZE as u64).unwrap();

    assert_eq!(
        dev.stats().pages_stored.load(Ordering::Relaxed),
        stored_before - 1
    );
    assert_eq!(dev.stats().notify_free.load(Ordering::Relaxed), 1);

    let mut out = vec![0xAAu8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn discard_skips_partially_covered_pages() {
    let dev = configured_device(16);
    let a = low_ratio_page(1);
    let b = low_ratio_page(2);
    dev.write(0, &a).unwrap();
    dev.write(8, &b).unwrap();

    // Covers the tail of page 0 and the head of page 1; neither is fully
    // covered, so nothing is freed.
    dev.discard(2, PAGE_SIZE as u64).unwrap();

    assert_eq!(dev.stats().pages_stored.load(Ordering::Relaxed), 2);
    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(out, a);
    dev.read(8, &mut out).unwrap();
    assert_eq!(out, b);
}

#[test]
fn write_zeroes_zeroes_partial_edges() {
    let dev = configured_device(16);
    let a = low_ratio_page(21);
    let b = low_ratio_page(22);
    dev.write(0, &a).unwrap();
    dev.write(8, &b).unwrap();

    // Tail of page 0, all of page 1? No — only tail of page 0 and head of
    // page 1: [1024..4096) and [4096..5120).
    dev.write_zeroes(2, PAGE_SIZE as u64).unwrap();

    let mut out = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert_eq!(&out[..1024], &a[..1024]);
    assert!(out[1024..].iter().all(|&x| x == 0));

    dev.read(8, &mut out).unwrap();
    assert!(out[..1024].iter().all(|&x| x == 0));
    assert_eq!(&out[1024..], &b[1024..]);
}

#[test]
fn slot_free_notify_frees_page() {
    let dev = configured_device(16);
    dev.write(0, &low_ratio_page(8)).unwrap();

    dev.slot_free_notify(0);

    assert_eq!(dev.stats().pages_stored.load(Ordering::Relaxed), 0);
    assert_eq!(dev.stats().notify_free.load(Ordering::Relaxed), 1);

    let mut out = vec![0xAAu8; PAGE_SIZE];
    dev.read(0, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn read_write_counters_track_page_operations() {
    let dev = configured_device(16);

    dev.write(0, &vec![1u8; 2 * PAGE_SIZE]).unwrap();
    let mut buf = vec![0u8; PAGE_SIZE];
    dev.read(0, &mut buf).unwrap();
    dev.read(8, &mut buf).unwrap();

    assert_eq!(dev.stats().num_writes.load(Ordering::Relaxed), 2);
    assert_eq!(dev.stats().num_reads.load(Ordering::Relaxed), 2);
}

#[test]
fn pool_limit_fails_writes_with_oom() {
    let dev = configured_device(64);
    dev.set_mem_limit(4 * PAGE_SIZE as u64);

    // Fill until the pool cap trips; incompressible pages consume a full
    // class object each.
    let mut failed = false;
    for i in 0..64u64 {
        if dev.write(i * SECTORS_PER_PAGE, &random_page(i + 1)).is_err() {
            failed = true;
            break;
        }
    }

    assert!(failed, "pool limit never enforced");
    assert!(dev.stats().failed_writes.load(Ordering::Relaxed) > 0);
}

#[test]
fn block_requests_submit_directly() {
    let dev = configured_device(16);
    let page = low_ratio_page(50);

    dev.submit(BlockRequest::Write {
        sector: 8,
        data: &page,
    })
    .unwrap();

    let mut out = vec![0u8; PAGE_SIZE];
    dev.submit(BlockRequest::Read {
        sector: 8,
        buf: &mut out,
    })
    .unwrap();
    assert_eq!(out, page);

    dev.submit(BlockRequest::Discard {
        sector: 8,
        len: PAGE_SIZE as u64,
    })
    .unwrap();
    dev.read(8, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn mem_used_max_tracks_high_water() {
    let dev = configured_device(64);
    for i in 0..8u64 {
        dev.write(i * SECTORS_PER_PAGE, &random_page(i + 1)).unwrap();
    }
    let high = dev.stats().max_used_pages.load(Ordering::Relaxed);
    assert!(high > 0);

    for i in 0..8u64 {
        dev.discard(i * SECTORS_PER_PAGE, PAGE_SIZE as u64).unwrap();
    }
    dev.compact().unwrap();

    // High-water mark survives the frees until explicitly reset.
    assert_eq!(dev.stats().max_used_pages.load(Ordering::Relaxed), high);
    dev.reset_mem_used_max();
    assert!(dev.stats().max_used_pages.load(Ordering::Relaxed) < high);
}
