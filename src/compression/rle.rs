//! Bitplane run-length codecs
//!
//! The `rleN` family (N ∈ {1, 2, 4, 8}) splits every byte of every pixel
//! into `8 / N`-bit groups and run-length encodes each group-plane of the
//! pixel stream separately. Lower N trades speed for ratio: `rle1` sees
//! eight nearly-monotone bit planes per byte, `rle8` sees the raw bytes.
//!
//! Each plane is encoded as a sequence of control bytes:
//!
//! * `0..=127` — a literal run of `control + 1` bytes follows.
//! * `128..=254` — the next byte repeats `255 - control` times.
//! * `255` — long repeat: a 16-bit big-endian length `L` follows, then one
//!   byte repeated `L + 1` times.
//!
//! For N < 8 each encoded byte packs the selected group of `8 / N`
//! consecutive pixels, and the `n mod (8 / N)` trailing pixels are appended
//! verbatim after all planes.

use super::Codec;
use crate::format::PixelFormat;

pub struct RleCodec {
    bits: u32,
}

pub static RLE1: RleCodec = RleCodec { bits: 1 };
pub static RLE2: RleCodec = RleCodec { bits: 2 };
pub static RLE4: RleCodec = RleCodec { bits: 4 };
pub static RLE8: RleCodec = RleCodec { bits: 8 };

/// Longest run a single repeat record can express
const MAX_REPEAT: usize = 1 << 16;
/// Longest literal run a single control byte can express
const MAX_LITERAL: usize = 128;

struct BoundedWriter<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl<'a> BoundedWriter<'a> {
    fn put(&mut self, value: u8) -> bool {
        if self.pos == self.dst.len() {
            return false;
        }
        self.dst[self.pos] = value;
        self.pos += 1;
        true
    }

    fn put_slice(&mut self, values: &[u8]) -> bool {
        if self.pos + values.len() > self.dst.len() {
            return false;
        }
        self.dst[self.pos..self.pos + values.len()].copy_from_slice(values);
        self.pos += values.len();
        true
    }
}

impl RleCodec {
    fn groups_per_byte(&self) -> usize {
        (8 / self.bits) as usize
    }

    /// Extracts the packed value stream for one (byte-plane, group) pass.
    ///
    /// `plane` selects the byte within the pixel, `group` the bit group
    /// within that byte. Pass `k` of a plane holds the bits
    /// `[8 - (k+1)·bits, 8 - k·bits)`, so group 0 is the most significant.
    fn pack_pass(&self, src: &[u8], n_vals: usize, plane: usize, group: usize, bpp: usize,
                 out: &mut Vec<u8>) {
        out.clear();
        let m = self.groups_per_byte();
        let shift = 8 - (group as u32 + 1) * self.bits;
        let low_mask = ((1u32 << self.bits) - 1) as u32;

        for j in 0..n_vals {
            let mut val = 0u32;
            for i in 0..m {
                let byte = src[(j * m + i) * bpp + plane] as u32;
                val |= ((byte >> shift) & low_mask) << (i as u32 * self.bits);
            }
            out.push(val as u8);
        }
    }

    /// Scatters one decoded pass back into the pixel stream.
    ///
    /// The first pass of a plane overwrites the byte, later passes shift
    /// previous groups left and OR the new group into the low bits.
    fn unpack_pass(&self, dst: &mut [u8], vals: &[u8], plane: usize, bpp: usize, init: bool) {
        let m = self.groups_per_byte();
        let low_mask = ((1u32 << self.bits) - 1) as u8;

        for (j, &v) in vals.iter().enumerate() {
            let mut v = v;
            for i in 0..m {
                let slot = &mut dst[(j * m + i) * bpp + plane];
                let prev = if init { *slot } else { 0 };
                *slot = prev.wrapping_shl(self.bits) | (v & low_mask);
                v = v.wrapping_shr(self.bits);
            }
        }
    }
}

/// Run-length encodes a value stream; `false` when the writer fills up
fn encode_stream(vals: &[u8], w: &mut BoundedWriter) -> bool {
    let mut i = 0;
    while i < vals.len() {
        let mut j = i + 1;
        while j < vals.len() && vals[j] == vals[i] && j - i < MAX_REPEAT {
            j += 1;
        }
        let run = j - i;

        if run >= 2 {
            if run < 128 {
                if !w.put((255 - run) as u8) {
                    return false;
                }
            } else {
                let len = (run - 1) as u16;
                if !w.put(255) || !w.put((len >> 8) as u8) || !w.put((len & 0xff) as u8) {
                    return false;
                }
            }
            if !w.put(vals[i]) {
                return false;
            }
            i = j;
        } else {
            let start = i;
            i += 1;
            while i < vals.len() && i - start < MAX_LITERAL {
                if i + 2 < vals.len() && vals[i] == vals[i + 1] && vals[i] == vals[i + 2] {
                    break;
                }
                if i + 1 == vals.len() - 1 && vals[i] == vals[i + 1] {
                    break;
                }
                i += 1;
            }
            if !w.put((i - start - 1) as u8) || !w.put_slice(&vals[start..i]) {
                return false;
            }
        }
    }
    true
}

/// Decodes one pass worth of values; `None` on malformed input
fn decode_stream(src: &[u8], pos: &mut usize, n_vals: usize, out: &mut Vec<u8>) -> Option<()> {
    out.clear();
    while out.len() < n_vals {
        let control = *src.get(*pos)?;
        *pos += 1;

        if control < 128 {
            let count = control as usize + 1;
            let lit = src.get(*pos..*pos + count)?;
            *pos += count;
            if out.len() + count > n_vals {
                return None;
            }
            out.extend_from_slice(lit);
        } else {
            let mut count = 255 - control as usize;
            if count == 0 {
                let hi = *src.get(*pos)? as usize;
                let lo = *src.get(*pos + 1)? as usize;
                *pos += 2;
                count = (hi << 8 | lo) + 1;
            }
            let val = *src.get(*pos)?;
            *pos += 1;
            if out.len() + count > n_vals {
                return None;
            }
            out.resize(out.len() + count, val);
        }
    }
    Some(())
}

impl Codec for RleCodec {
    fn compress(
        &self,
        format: PixelFormat,
        src: &[u8],
        n: usize,
        dst: &mut [u8],
    ) -> Option<usize> {
        let bpp = format.bytes_per_pixel();
        let m = self.groups_per_byte();
        let n_vals = n / m;

        let mut w = BoundedWriter { dst, pos: 0 };
        let mut vals = Vec::with_capacity(n_vals);

        for pass in 0..m * bpp {
            self.pack_pass(src, n_vals, pass / m, pass % m, bpp, &mut vals);
            if !encode_stream(&vals, &mut w) {
                return None;
            }
        }

        if m > 1 {
            let rem = (n % m) * bpp;
            if !w.put_slice(&src[n * bpp - rem..n * bpp]) {
                return None;
            }
        }

        Some(w.pos)
    }

    fn decompress(
        &self,
        format: PixelFormat,
        dst: &mut [u8],
        n: usize,
        compressed: &[u8],
    ) -> bool {
        let bpp = format.bytes_per_pixel();
        let m = self.groups_per_byte();
        let n_vals = n / m;

        if dst.len() < n * bpp {
            return false;
        }

        let mut pos = 0;
        let mut vals = Vec::with_capacity(n_vals);

        for pass in 0..m * bpp {
            if decode_stream(compressed, &mut pos, n_vals, &mut vals).is_none() {
                return false;
            }
            self.unpack_pass(dst, &vals, pass / m, bpp, pass % m != 0);
        }

        if m > 1 {
            let rem = (n % m) * bpp;
            match compressed.get(pos..pos + rem) {
                Some(tail) => dst[n * bpp - rem..n * bpp].copy_from_slice(tail),
                None => return false,
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: &RleCodec, fmt: PixelFormat, src: &[u8], n: usize) -> Vec<u8> {
        let mut compressed = vec![0u8; src.len() * 3 + 64];
        let size = codec.compress(fmt, src, n, &mut compressed).expect("compress");
        let mut out = vec![0u8; src.len()];
        assert!(codec.decompress(fmt, &mut out, n, &compressed[..size]));
        assert_eq!(src, &out[..]);
        compressed.truncate(size);
        compressed
    }

    #[test]
    fn test_solid_block_compresses_well() {
        let n = 4096;
        let src = vec![0x5Au8; n * 4];
        for codec in [&RLE1, &RLE2, &RLE4, &RLE8] {
            let compressed = round_trip(codec, PixelFormat::RGBA_U8, &src, n);
            assert!(
                compressed.len() < src.len() / 16,
                "rle{} only reached {} bytes",
                codec.bits,
                compressed.len()
            );
        }
    }

    #[test]
    fn test_alternating_pixels_round_trip() {
        // worst case for rle8: no byte-level runs at all
        let n = 65536;
        let mut src = vec![0u8; n];
        for (i, b) in src.iter_mut().enumerate() {
            *b = if i % 2 == 0 { 0x00 } else { 0xFF };
        }
        let compressed = round_trip(&RLE8, PixelFormat::Y_U8, &src, n);
        // adversarial input must expand past the nop codec's n bytes
        assert!(compressed.len() > n);
    }

    #[test]
    fn test_alternating_pixels_rle1_collapses() {
        // the same adversarial stream is all-runs at the bit level
        let n = 65536;
        let mut src = vec![0u8; n];
        for (i, b) in src.iter_mut().enumerate() {
            *b = if i % 2 == 0 { 0x00 } else { 0xFF };
        }
        let compressed = round_trip(&RLE1, PixelFormat::Y_U8, &src, n);
        assert!(compressed.len() < n / 64);
    }

    #[test]
    fn test_long_repeat_form() {
        // a run longer than 127 forces the 255-control long form
        let n = 1000;
        let src = vec![7u8; n];
        let compressed = round_trip(&RLE8, PixelFormat::Y_U8, &src, n);
        assert_eq!(compressed[0], 255);
        assert_eq!(
            ((compressed[1] as usize) << 8 | compressed[2] as usize) + 1,
            n
        );
        assert_eq!(compressed[3], 7);
    }

    #[test]
    fn test_short_repeat_form() {
        let src = [9u8, 9, 9, 1, 2];
        let compressed = round_trip(&RLE8, PixelFormat::Y_U8, &src, 5);
        assert_eq!(compressed[0], 255 - 3);
        assert_eq!(compressed[1], 9);
        assert_eq!(compressed[2], 1); // literal of two
        assert_eq!(&compressed[3..], &[1, 2]);
    }

    #[test]
    fn test_tail_pixels_verbatim() {
        // n not divisible by groups-per-byte leaves a verbatim tail
        let n = 1027;
        let src: Vec<u8> = (0..n).map(|i| (i % 253) as u8).collect();
        for codec in [&RLE1, &RLE2, &RLE4] {
            round_trip(codec, PixelFormat::Y_U8, &src, n);
        }
    }

    #[test]
    fn test_multibyte_pixels() {
        let n = 300;
        let src: Vec<u8> = (0..n * 8).map(|i| (i * 13 % 256) as u8) .collect();
        let fmt = PixelFormat::new(
            crate::format::ColorModel::Rgba,
            crate::format::ComponentType::U16,
        );
        for codec in [&RLE1, &RLE2, &RLE4, &RLE8] {
            round_trip(codec, fmt, &src, n);
        }
    }

    #[test]
    fn test_output_too_small_is_safe() {
        let n = 65536;
        let mut src = vec![0u8; n];
        for (i, b) in src.iter_mut().enumerate() {
            *b = (i % 2) as u8 * 255;
        }
        let mut buf = vec![0xEEu8; 8];
        assert!(RLE8.compress(PixelFormat::Y_U8, &src, n, &mut buf[..4]).is_none());
        assert_eq!(&buf[4..], &[0xEE; 4]);
    }

    #[test]
    fn test_decompress_truncated_input() {
        let n = 100;
        let src = vec![3u8; n];
        let mut compressed = vec![0u8; 256];
        let size = RLE8.compress(PixelFormat::Y_U8, &src, n, &mut compressed).unwrap();
        let mut out = vec![0u8; n];
        assert!(!RLE8.decompress(PixelFormat::Y_U8, &mut out, n, &compressed[..size - 1]));
    }

    #[test]
    fn test_decoder_accepts_254_as_single_repeat() {
        // control 254 is never emitted but must decode as one repeat
        let stream = [254u8, 42, 0, 7];
        let mut out = [0u8; 2];
        assert!(RLE8.decompress(PixelFormat::Y_U8, &mut out, 2, &stream));
        assert_eq!(out, [42, 7]);
    }
}
