//! Shared pixel algorithms
//!
//! Row copies specialized on the fixed set of bytes-per-row values the tile
//! loops produce, pattern fills, the 2×2 box downscale behind mipmap levels,
//! and the three strip resamplers used by scaled reads.

use crate::format::{ComponentType, PixelFormat};
use crate::rect::Rect;

/// Copies `rows` rows of `row_bytes` bytes between strided buffers.
///
/// Dispatches on the row width so the common pixel sizes compile down to
/// fixed-size (and, when the strides allow, register-wide) moves.
pub fn copy_rows(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    #[inline(always)]
    fn fixed<const N: usize>(
        dst: &mut [u8],
        dst_stride: usize,
        src: &[u8],
        src_stride: usize,
        rows: usize,
    ) {
        for row in 0..rows {
            let d: &mut [u8; N] = (&mut dst[row * dst_stride..row * dst_stride + N])
                .try_into()
                .unwrap();
            let s: &[u8; N] = (&src[row * src_stride..row * src_stride + N])
                .try_into()
                .unwrap();
            *d = *s;
        }
    }

    match row_bytes {
        1 => fixed::<1>(dst, dst_stride, src, src_stride, rows),
        2 => fixed::<2>(dst, dst_stride, src, src_stride, rows),
        3 => fixed::<3>(dst, dst_stride, src, src_stride, rows),
        4 => fixed::<4>(dst, dst_stride, src, src_stride, rows),
        6 => fixed::<6>(dst, dst_stride, src, src_stride, rows),
        8 => fixed::<8>(dst, dst_stride, src, src_stride, rows),
        12 => fixed::<12>(dst, dst_stride, src, src_stride, rows),
        16 => fixed::<16>(dst, dst_stride, src, src_stride, rows),
        24 => fixed::<24>(dst, dst_stride, src, src_stride, rows),
        32 => fixed::<32>(dst, dst_stride, src, src_stride, rows),
        40 => fixed::<40>(dst, dst_stride, src, src_stride, rows),
        48 => fixed::<48>(dst, dst_stride, src, src_stride, rows),
        56 => fixed::<56>(dst, dst_stride, src, src_stride, rows),
        64 => fixed::<64>(dst, dst_stride, src, src_stride, rows),
        _ => {
            for row in 0..rows {
                dst[row * dst_stride..row * dst_stride + row_bytes]
                    .copy_from_slice(&src[row * src_stride..row * src_stride + row_bytes]);
            }
        }
    }
}

/// Fills `dst` with `count` repetitions of `pattern` using doubling copies
pub fn memset_pattern(dst: &mut [u8], pattern: &[u8], count: usize) {
    let size = pattern.len();
    if count == 0 || size == 0 {
        return;
    }
    dst[..size].copy_from_slice(pattern);
    let total = size * count;
    let mut filled = size;
    while filled < total {
        let chunk = filled.min(total - filled);
        let (done, rest) = dst.split_at_mut(filled);
        rest[..chunk].copy_from_slice(&done[..chunk]);
        filled += chunk;
    }
}

/// Whether every byte of `data` is zero
pub fn memeq_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

macro_rules! for_each_component_type {
    ($component:expr, $macro:ident) => {
        match $component {
            ComponentType::U8 => $macro!(u8, u32),
            ComponentType::U16 => $macro!(u16, u32),
            ComponentType::U32 => $macro!(u32, u64),
            ComponentType::F32 => $macro!(f32, f32),
            ComponentType::F64 => $macro!(f64, f64),
        }
    };
}

#[inline]
fn read_component<T: Copy>(bytes: &[u8], index: usize) -> T {
    // components inside a tile row are always contiguous and in range
    unsafe { (bytes.as_ptr() as *const T).add(index).read_unaligned() }
}

#[inline]
fn write_component<T: Copy>(bytes: &mut [u8], index: usize, value: T) {
    unsafe { (bytes.as_mut_ptr() as *mut T).add(index).write_unaligned(value) }
}

/// Box-averages a `src_width × src_height` block down by 2× per axis.
///
/// Destination dimensions are the halved source dimensions rounded up; odd
/// trailing rows/columns average the samples that exist.
pub fn downscale_2x2(
    format: PixelFormat,
    src_width: usize,
    src_height: usize,
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
) {
    if src_width == 0 || src_height == 0 {
        return;
    }
    let components = format.components();
    let dst_width = src_width.div_ceil(2);
    let dst_height = src_height.div_ceil(2);

    macro_rules! impl_downscale {
        ($ty:ty, $sum:ty) => {{
            for dy in 0..dst_height {
                let sy0 = dy * 2;
                let sy1 = (sy0 + 1).min(src_height - 1);
                let row0 = &src[sy0 * src_stride..];
                let row1 = &src[sy1 * src_stride..];
                let drow = &mut dst[dy * dst_stride..];
                for dx in 0..dst_width {
                    let sx0 = dx * 2;
                    let sx1 = (sx0 + 1).min(src_width - 1);
                    for c in 0..components {
                        let a: $ty = read_component(row0, sx0 * components + c);
                        let b: $ty = read_component(row0, sx1 * components + c);
                        let d: $ty = read_component(row1, sx0 * components + c);
                        let e: $ty = read_component(row1, sx1 * components + c);
                        let sum = a as $sum + b as $sum + d as $sum + e as $sum;
                        write_component::<$ty>(
                            drow,
                            dx * components + c,
                            (sum / 4 as $sum) as $ty,
                        );
                    }
                }
            }
        }};
    }

    for_each_component_type!(format.component, impl_downscale);
}

/// Nearest-neighbor strip resample from `src_rect` into `dst_rect`
pub fn resample_nearest(
    dst: &mut [u8],
    src: &[u8],
    dst_rect: &Rect,
    src_rect: &Rect,
    src_stride: usize,
    scale: f64,
    bpp: usize,
    dst_stride: usize,
) {
    let mut col_offsets = Vec::with_capacity(dst_rect.width as usize);
    for x in 0..dst_rect.width {
        let sx = (dst_rect.x as f64 + 0.5 + x as f64) / scale - src_rect.x as f64;
        col_offsets.push((sx.floor() as isize).clamp(0, src_rect.width as isize - 1) as usize * bpp);
    }

    for y in 0..dst_rect.height as usize {
        let sy = (dst_rect.y as f64 + 0.5 + y as f64) / scale - src_rect.y as f64;
        let row = (sy.floor() as isize).clamp(0, src_rect.height as isize - 1) as usize;
        let src_row = &src[row * src_stride..];
        let dst_row = &mut dst[y * dst_stride..];
        for (x, &off) in col_offsets.iter().enumerate() {
            dst_row[x * bpp..(x + 1) * bpp].copy_from_slice(&src_row[off..off + bpp]);
        }
    }
}

/// Bilinear strip resample; `src` must extend one sample past `src_rect`
/// on the right and bottom.
pub fn resample_bilinear(
    dst: &mut [u8],
    src: &[u8],
    dst_rect: &Rect,
    src_rect: &Rect,
    src_stride: usize,
    scale: f64,
    format: PixelFormat,
    dst_stride: usize,
) {
    let components = format.components();

    macro_rules! impl_bilinear {
        ($ty:ty, $sum:ty) => {{
            for y in 0..dst_rect.height as usize {
                let sy = (dst_rect.y as f64 + y as f64 + 0.5) / scale - src_rect.y as f64 - 0.5;
                let iy = sy.floor().max(0.0) as usize;
                let fy = (sy - iy as f64).clamp(0.0, 1.0) as f32;
                let row0 = &src[iy * src_stride..];
                let row1 = &src[(iy + 1) * src_stride..];
                let dst_row = &mut dst[y * dst_stride..];
                for x in 0..dst_rect.width as usize {
                    let sx =
                        (dst_rect.x as f64 + x as f64 + 0.5) / scale - src_rect.x as f64 - 0.5;
                    let ix = sx.floor().max(0.0) as usize;
                    let fx = (sx - ix as f64).clamp(0.0, 1.0) as f32;
                    for c in 0..components {
                        let p00: $ty = read_component(row0, ix * components + c);
                        let p10: $ty = read_component(row0, (ix + 1) * components + c);
                        let p01: $ty = read_component(row1, ix * components + c);
                        let p11: $ty = read_component(row1, (ix + 1) * components + c);
                        let top = p00 as f32 + (p10 as f32 - p00 as f32) * fx;
                        let bottom = p01 as f32 + (p11 as f32 - p01 as f32) * fx;
                        let value = top + (bottom - top) * fy;
                        write_component::<$ty>(
                            dst_row,
                            x * components + c,
                            round_to::<$ty>(value),
                        );
                    }
                }
            }
        }};
    }

    for_each_component_type!(format.component, impl_bilinear);
}

/// Box-filter strip resample; `src` must extend one sample past `src_rect`
/// on every side. Each destination pixel averages the source span it covers
/// (at most three samples per axis for scales above one half).
pub fn resample_boxfilter(
    dst: &mut [u8],
    src: &[u8],
    dst_rect: &Rect,
    src_rect: &Rect,
    src_stride: usize,
    scale: f64,
    format: PixelFormat,
    dst_stride: usize,
) {
    let components = format.components();

    // per-axis spans: (first sample index, weights)
    let spans = |origin: i32, extent: i32, src_origin: i32| -> Vec<(usize, [f32; 3], usize)> {
        (0..extent)
            .map(|i| {
                let left = (origin + i) as f64 / scale - src_origin as f64;
                let right = (origin + i + 1) as f64 / scale - src_origin as f64;
                let i0 = left.floor() as isize;
                let i1 = ((right - 1e-9).floor() as isize).max(i0);
                let taps = ((i1 - i0) as usize + 1).min(3);
                let mut w = [0.0f32; 3];
                for t in 0..taps {
                    let lo = (i0 + t as isize) as f64;
                    let cover = (right.min(lo + 1.0) - left.max(lo)).max(0.0);
                    w[t] = cover as f32;
                }
                let norm = (right - left) as f32;
                for wt in w.iter_mut() {
                    *wt /= norm;
                }
                // src has a one-sample margin on each side
                (((i0 + 1).max(0)) as usize, w, taps)
            })
            .collect()
    };

    let cols = spans(dst_rect.x, dst_rect.width, src_rect.x + 1);
    let rows = spans(dst_rect.y, dst_rect.height, src_rect.y + 1);

    macro_rules! impl_boxfilter {
        ($ty:ty, $sum:ty) => {{
            for (y, &(ry, rw, rtaps)) in rows.iter().enumerate() {
                let dst_row = &mut dst[y * dst_stride..];
                for (x, &(cx, cw, ctaps)) in cols.iter().enumerate() {
                    for c in 0..components {
                        let mut acc = 0.0f32;
                        for ty_i in 0..rtaps {
                            let row = &src[(ry + ty_i) * src_stride..];
                            let mut line = 0.0f32;
                            for tx in 0..ctaps {
                                let v: $ty = read_component(row, (cx + tx) * components + c);
                                line += v as f32 * cw[tx];
                            }
                            acc += line * rw[ty_i];
                        }
                        write_component::<$ty>(dst_row, x * components + c, round_to::<$ty>(acc));
                    }
                }
            }
        }};
    }

    for_each_component_type!(format.component, impl_boxfilter);
}

trait FromF32 {
    fn from_f32(v: f32) -> Self;
}

macro_rules! impl_from_f32_int {
    ($($ty:ty),*) => {$(
        impl FromF32 for $ty {
            #[inline]
            fn from_f32(v: f32) -> Self {
                let max = <$ty>::MAX as f32;
                (v + 0.5).clamp(0.0, max) as $ty
            }
        }
    )*};
}

impl_from_f32_int!(u8, u16, u32);

impl FromF32 for f32 {
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl FromF32 for f64 {
    #[inline]
    fn from_f32(v: f32) -> Self {
        v as f64
    }
}

#[inline]
fn round_to<T: FromF32>(v: f32) -> T {
    T::from_f32(v)
}
