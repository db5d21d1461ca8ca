//! # Compression Backend
//!
//! The device compresses through the [`Codec`] seam. Algorithms are
//! selected by name while the device is unconfigured; the registry knows
//! "lz4" (default) and "snappy".
//!
//! ## Streams
//!
//! Compression needs a scratch buffer larger than a page. Rather than
//! allocating one per write, [`CodecStreams`] keeps a pool of reusable
//! workspaces sized to the worst-case output. The write path *borrows* a
//! stream for the duration of one compression; the borrow must be
//! returned before any allocation that may stall, because a stalled
//! writer holding a workspace starves every other writer once the pool
//! is at its width. After re-acquiring a stream the page is compressed
//! again — the previous output lived in the returned buffer.

mod lz4;
mod snappy;

use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;

use crate::config::COMP_BUFFER_SIZE;

pub use lz4::Lz4Codec;
pub use snappy::SnappyCodec;

/// A page compressor/decompressor.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compress `src` into `dst`, returning the compressed length.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompress `src` into `dst`, which must be exactly the original
    /// length.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// Names accepted by [`create`].
pub const ALGORITHMS: &[&str] = &["lz4", "snappy"];

pub fn is_available(name: &str) -> bool {
    ALGORITHMS.contains(&name)
}

/// Instantiate a codec by name.
pub fn create(name: &str) -> Result<Arc<dyn Codec>> {
    match name {
        "lz4" => Ok(Arc::new(Lz4Codec)),
        "snappy" => Ok(Arc::new(SnappyCodec)),
        other => bail!("unknown compression algorithm: {other}"),
    }
}

/// Render the algorithm list with the selected one bracketed, e.g.
/// `[lz4] snappy`.
pub fn format_available(current: &str) -> String {
    ALGORITHMS
        .iter()
        .map(|name| {
            if *name == current {
                format!("[{name}]")
            } else {
                (*name).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One borrowed compression workspace.
pub struct CompressStream {
    pub buffer: Box<[u8]>,
}

impl CompressStream {
    fn new() -> Self {
        Self {
            buffer: vec![0u8; COMP_BUFFER_SIZE].into_boxed_slice(),
        }
    }
}

/// Bounded pool of compression workspaces.
pub struct CodecStreams {
    free: Mutex<Vec<CompressStream>>,
    width: usize,
}

impl CodecStreams {
    pub fn new() -> Self {
        let width = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_width(width)
    }

    pub fn with_width(width: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            width: width.max(1),
        }
    }

    /// Borrow a workspace. Never fails; a fresh workspace is allocated
    /// when the pool is empty.
    pub fn get(&self) -> CompressStream {
        self.free.lock().pop().unwrap_or_else(CompressStream::new)
    }

    /// Return a workspace. Excess workspaces beyond the pool width are
    /// dropped.
    pub fn put(&self, stream: CompressStream) {
        let mut free = self.free.lock();
        if free.len() < self.width {
            free.push(stream);
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl Default for CodecStreams {
    fn default() -> Self {
        Self::new()
    }
}
