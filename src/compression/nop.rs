//! Identity codec
//!
//! Stores pixel bytes verbatim. Fails to compress only when the destination
//! is smaller than the input.

use super::Codec;
use crate::format::PixelFormat;

pub struct NopCodec;

pub static NOP: NopCodec = NopCodec;

impl Codec for NopCodec {
    fn compress(
        &self,
        format: PixelFormat,
        src: &[u8],
        n: usize,
        dst: &mut [u8],
    ) -> Option<usize> {
        let size = n * format.bytes_per_pixel();
        if dst.len() < size {
            return None;
        }
        dst[..size].copy_from_slice(&src[..size]);
        Some(size)
    }

    fn decompress(
        &self,
        format: PixelFormat,
        dst: &mut [u8],
        n: usize,
        compressed: &[u8],
    ) -> bool {
        let size = n * format.bytes_per_pixel();
        if compressed.len() != size || dst.len() < size {
            return false;
        }
        dst[..size].copy_from_slice(compressed);
        true
    }
}
