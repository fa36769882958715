//! Lossless tile compression codecs
//!
//! Codecs compress a block of `n` pixels in a given [`PixelFormat`] into a
//! caller-provided byte buffer. A codec must never write past the
//! destination; when the output does not fit it reports failure and the
//! caller stores the block uncompressed instead.
//!
//! The registry is built once and is read-only afterwards. Besides the
//! concrete codecs it carries three virtual aliases resolved at build time:
//! `fast`, `balanced` and `best`.

pub mod nop;
pub mod rle;
pub mod zlib;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::format::PixelFormat;

/// A lossless byte-block codec
pub trait Codec: Send + Sync {
    /// Compresses `n` pixels from `src` into `dst`.
    ///
    /// Returns the compressed size, or `None` when the result would not fit
    /// in `dst` (in which case the contents of `dst` are unspecified but no
    /// byte outside it has been touched).
    fn compress(&self, format: PixelFormat, src: &[u8], n: usize, dst: &mut [u8])
        -> Option<usize>;

    /// Decompresses `compressed` into exactly `n` pixels in `dst`.
    ///
    /// Returns `false` on malformed input.
    fn decompress(&self, format: PixelFormat, dst: &mut [u8], n: usize, compressed: &[u8])
        -> bool;
}

fn registry() -> &'static BTreeMap<&'static str, &'static (dyn Codec + 'static)> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, &'static (dyn Codec + 'static)>> =
        OnceLock::new();

    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<&'static str, &'static (dyn Codec + 'static)> = BTreeMap::new();

        map.insert("nop", &nop::NOP);

        map.insert("rle1", &rle::RLE1);
        map.insert("rle2", &rle::RLE2);
        map.insert("rle4", &rle::RLE4);
        map.insert("rle8", &rle::RLE8);

        map.insert("zlib", &zlib::ZLIB_DEFAULT);
        for &(name, codec) in zlib::LEVELS {
            map.insert(name, codec);
        }

        register_alias(&mut map, "fast", &["rle8", "zlib1", "nop"]);
        register_alias(&mut map, "balanced", &["rle4", "zlib", "nop"]);
        register_alias(&mut map, "best", &["zlib9", "rle1", "nop"]);

        map
    })
}

fn register_alias(
    map: &mut BTreeMap<&'static str, &'static (dyn Codec + 'static)>,
    name: &'static str,
    candidates: &[&str],
) {
    for candidate in candidates {
        if let Some(codec) = map.get(candidate).copied() {
            map.insert(name, codec);
            return;
        }
    }
}

/// Looks up a codec by name
pub fn codec(name: &str) -> Option<&'static dyn Codec> {
    registry().get(name).copied()
}

/// All registered codec names, sorted
pub fn codec_list() -> Vec<&'static str> {
    registry().keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_pixels(n: usize, bpp: usize) -> Vec<u8> {
        (0..n * bpp).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_registry_has_all_names() {
        for name in [
            "nop", "rle1", "rle2", "rle4", "rle8", "zlib", "zlib1", "zlib5", "zlib9", "fast",
            "balanced", "best",
        ] {
            assert!(codec(name).is_some(), "missing codec {}", name);
        }
        assert!(codec("lzma").is_none());
    }

    #[test]
    fn test_codec_list_sorted() {
        let list = codec_list();
        let mut sorted = list.clone();
        sorted.sort_unstable();
        assert_eq!(list, sorted);
        assert!(list.contains(&"balanced"));
    }

    #[test]
    fn test_round_trip_all_codecs_all_formats() {
        let formats = [
            PixelFormat::RGBA_U8,
            PixelFormat::Y_U8,
            PixelFormat::RGBA_U16,
            PixelFormat::RGBA_F32,
        ];
        let n = 777;
        for name in codec_list() {
            let c = codec(name).unwrap();
            for fmt in formats {
                let bpp = fmt.bytes_per_pixel();
                let src = gradient_pixels(n, bpp);
                let mut compressed = vec![0u8; n * bpp * 3 + 64];
                let size = c
                    .compress(fmt, &src, n, &mut compressed)
                    .unwrap_or_else(|| panic!("{} failed to compress {:?}", name, fmt));
                let mut out = vec![0u8; n * bpp];
                assert!(
                    c.decompress(fmt, &mut out, n, &compressed[..size]),
                    "{} failed to decompress {:?}",
                    name,
                    fmt
                );
                assert_eq!(src, out, "{} corrupted {:?}", name, fmt);
            }
        }
    }

    #[test]
    fn test_bound_safety_all_codecs() {
        let fmt = PixelFormat::RGBA_U8;
        let n = 512;
        let src = gradient_pixels(n, 4);
        for name in codec_list() {
            let c = codec(name).unwrap();
            // way too small: every codec must refuse without overrun
            let mut guarded = vec![0xABu8; 16];
            let result = c.compress(fmt, &src, n, &mut guarded[..8]);
            assert!(result.is_none(), "{} claimed to fit 2048 bytes in 8", name);
            assert_eq!(&guarded[8..], &[0xAB; 8], "{} overran its buffer", name);
        }
    }

    #[test]
    fn test_alias_resolution() {
        // aliases must behave identically to their backing codec
        let fmt = PixelFormat::RGBA_U8;
        let n = 256;
        let src = gradient_pixels(n, 4);
        for (alias, backing) in [("fast", "rle8"), ("balanced", "rle4"), ("best", "zlib9")] {
            let a = codec(alias).unwrap();
            let b = codec(backing).unwrap();
            let mut out_a = vec![0u8; 8192];
            let mut out_b = vec![0u8; 8192];
            let sa = a.compress(fmt, &src, n, &mut out_a).unwrap();
            let sb = b.compress(fmt, &src, n, &mut out_b).unwrap();
            assert_eq!(out_a[..sa], out_b[..sb]);
        }
    }
}
