//! Snappy codec.

use eyre::{ensure, eyre, Result};

use super::Codec;

pub struct SnappyCodec;

impl Codec for SnappyCodec {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        snap::raw::Encoder::new()
            .compress(src, dst)
            .map_err(|e| eyre!("snappy compression failed: {e}"))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let written = snap::raw::Decoder::new()
            .decompress(src, dst)
            .map_err(|e| eyre!("snappy decompression failed: {e}"))?;
        ensure!(
            written == dst.len(),
            "snappy short decompression: {} != {}",
            written,
            dst.len()
        );
        Ok(())
    }
}
