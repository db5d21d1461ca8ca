//! LZ4 block codec, the default algorithm.

use eyre::{ensure, eyre, Result};
use lz4_flex::block;

use super::Codec;

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        block::compress_into(src, dst).map_err(|e| eyre!("lz4 compression failed: {e}"))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let written =
            block::decompress_into(src, dst).map_err(|e| eyre!("lz4 decompression failed: {e}"))?;
        ensure!(
            written == dst.len(),
            "lz4 short decompression: {} != {}",
            written,
            dst.len()
        );
        Ok(())
    }
}
