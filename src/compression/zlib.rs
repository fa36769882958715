//! Deflate codecs
//!
//! `zlib` runs at the default level; `zlib1` through `zlib9` at fixed
//! levels. A single-shot deflate with `Finish` either ends the stream
//! within the destination buffer or the codec reports failure.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::Codec;
use crate::format::PixelFormat;

pub struct ZlibCodec {
    level: u32,
}

pub static ZLIB_DEFAULT: ZlibCodec = ZlibCodec { level: 6 };

pub static LEVELS: &[(&str, &ZlibCodec)] = &[
    ("zlib1", &ZlibCodec { level: 1 }),
    ("zlib2", &ZlibCodec { level: 2 }),
    ("zlib3", &ZlibCodec { level: 3 }),
    ("zlib4", &ZlibCodec { level: 4 }),
    ("zlib5", &ZlibCodec { level: 5 }),
    ("zlib6", &ZlibCodec { level: 6 }),
    ("zlib7", &ZlibCodec { level: 7 }),
    ("zlib8", &ZlibCodec { level: 8 }),
    ("zlib9", &ZlibCodec { level: 9 }),
];

impl Codec for ZlibCodec {
    fn compress(
        &self,
        format: PixelFormat,
        src: &[u8],
        n: usize,
        dst: &mut [u8],
    ) -> Option<usize> {
        let size = n * format.bytes_per_pixel();
        let mut stream = Compress::new(Compression::new(self.level), true);

        match stream.compress(&src[..size], dst, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => Some(stream.total_out() as usize),
            _ => None,
        }
    }

    fn decompress(
        &self,
        format: PixelFormat,
        dst: &mut [u8],
        n: usize,
        compressed: &[u8],
    ) -> bool {
        let size = n * format.bytes_per_pixel();
        let mut stream = Decompress::new(true);

        match stream.decompress(compressed, &mut dst[..size], FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => stream.total_out() as usize == size,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let n = 2048;
        let src: Vec<u8> = (0..n * 4).map(|i| (i / 7 % 256) as u8).collect();
        let mut compressed = vec![0u8; n * 4 + 64];
        let size = ZLIB_DEFAULT
            .compress(PixelFormat::RGBA_U8, &src, n, &mut compressed)
            .unwrap();
        assert!(size < src.len());
        let mut out = vec![0u8; n * 4];
        assert!(ZLIB_DEFAULT.decompress(PixelFormat::RGBA_U8, &mut out, n, &compressed[..size]));
        assert_eq!(src, out);
    }

    #[test]
    fn test_levels_trade_size() {
        let n = 4096;
        let src: Vec<u8> = (0..n * 4).map(|i| ((i * i) % 251) as u8).collect();
        let mut buf = vec![0u8; n * 8];
        let fast = LEVELS[0].1.compress(PixelFormat::RGBA_U8, &src, n, &mut buf).unwrap();
        let best = LEVELS[8].1.compress(PixelFormat::RGBA_U8, &src, n, &mut buf).unwrap();
        assert!(best <= fast);
    }

    #[test]
    fn test_too_small_output() {
        let n = 1024;
        let src: Vec<u8> = (0..n).map(|i| (i % 256) as u8).collect();
        let mut tiny = [0u8; 4];
        assert!(ZLIB_DEFAULT.compress(PixelFormat::Y_U8, &src, n, &mut tiny).is_none());
    }

    #[test]
    fn test_decompress_size_mismatch() {
        let src = vec![1u8; 64];
        let mut compressed = vec![0u8; 256];
        let size = ZLIB_DEFAULT
            .compress(PixelFormat::Y_U8, &src, 64, &mut compressed)
            .unwrap();
        // claim a different pixel count than was encoded
        let mut out = vec![0u8; 128];
        assert!(!ZLIB_DEFAULT.decompress(PixelFormat::Y_U8, &mut out, 128, &compressed[..size]));
    }

    #[test]
    fn test_garbage_input() {
        let mut out = vec![0u8; 64];
        assert!(!ZLIB_DEFAULT.decompress(PixelFormat::Y_U8, &mut out, 64, &[1, 2, 3, 4]));
    }
}
