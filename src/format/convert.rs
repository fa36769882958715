//! Pixel format conversion
//!
//! These two entry points are the engine's only window into pixel
//! semantics. Conversion goes through a straight (non-premultiplied) RGBA
//! double intermediate: decode components, resolve the color model, encode.
//! Same-format calls degrade to plain copies.

use super::{ColorModel, ComponentType, PixelFormat};

/// Converts `n` pixels from `src` (in `from`) into `dst` (in `to`).
///
/// `src` must hold at least `n * from.bytes_per_pixel()` bytes and `dst`
/// at least `n * to.bytes_per_pixel()`.
pub fn convert_pixels(from: PixelFormat, to: PixelFormat, src: &[u8], dst: &mut [u8], n: usize) {
    let src_bpp = from.bytes_per_pixel();
    let dst_bpp = to.bytes_per_pixel();
    debug_assert!(src.len() >= n * src_bpp);
    debug_assert!(dst.len() >= n * dst_bpp);

    if from == to {
        dst[..n * dst_bpp].copy_from_slice(&src[..n * src_bpp]);
        return;
    }

    for i in 0..n {
        let sp = &src[i * src_bpp..(i + 1) * src_bpp];
        let dp = &mut dst[i * dst_bpp..(i + 1) * dst_bpp];
        let rgba = decode_pixel(from, sp);
        encode_pixel(to, rgba, dp);
    }
}

/// Converts a `width × height` block row by row with independent strides.
pub fn convert_rows(
    from: PixelFormat,
    to: PixelFormat,
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    height: usize,
) {
    let src_row_bytes = width * from.bytes_per_pixel();
    let dst_row_bytes = width * to.bytes_per_pixel();
    for row in 0..height {
        let sp = &src[row * src_stride..row * src_stride + src_row_bytes];
        let dp = &mut dst[row * dst_stride..row * dst_stride + dst_row_bytes];
        convert_pixels(from, to, sp, dp, width);
    }
}

fn decode_component(component: ComponentType, bytes: &[u8]) -> f64 {
    match component {
        ComponentType::U8 => bytes[0] as f64 / 255.0,
        ComponentType::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as f64 / 65535.0,
        ComponentType::U32 => {
            u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64 / 4294967295.0
        }
        ComponentType::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        ComponentType::F64 => f64::from_ne_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]),
    }
}

fn encode_component(component: ComponentType, value: f64, bytes: &mut [u8]) {
    match component {
        ComponentType::U8 => {
            bytes[0] = (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
        }
        ComponentType::U16 => {
            let v = (value.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16;
            bytes[..2].copy_from_slice(&v.to_ne_bytes());
        }
        ComponentType::U32 => {
            let v = (value.clamp(0.0, 1.0) * 4294967295.0 + 0.5) as u32;
            bytes[..4].copy_from_slice(&v.to_ne_bytes());
        }
        ComponentType::F32 => {
            bytes[..4].copy_from_slice(&(value as f32).to_ne_bytes());
        }
        ComponentType::F64 => {
            bytes[..8].copy_from_slice(&value.to_ne_bytes());
        }
    }
}

/// Decodes one pixel into straight RGBA
fn decode_pixel(fmt: PixelFormat, bytes: &[u8]) -> [f64; 4] {
    let size = fmt.component.size();
    let n = fmt.components();
    let mut c = [0.0f64; 5];
    for (i, slot) in c.iter_mut().take(n).enumerate() {
        *slot = decode_component(fmt.component, &bytes[i * size..]);
    }

    match fmt.model {
        ColorModel::Y => [c[0], c[0], c[0], 1.0],
        ColorModel::Ya => [c[0], c[0], c[0], c[1]],
        ColorModel::YaPremul => {
            let y = unpremultiply(c[0], c[1]);
            [y, y, y, c[1]]
        }
        ColorModel::Rgb => [c[0], c[1], c[2], 1.0],
        ColorModel::Rgba => [c[0], c[1], c[2], c[3]],
        ColorModel::RgbaPremul => [
            unpremultiply(c[0], c[3]),
            unpremultiply(c[1], c[3]),
            unpremultiply(c[2], c[3]),
            c[3],
        ],
        ColorModel::Cmyk => cmyk_to_rgb(c[0], c[1], c[2], c[3], 1.0),
        ColorModel::Cmyka => cmyk_to_rgb(c[0], c[1], c[2], c[3], c[4]),
        ColorModel::CmykaPremul => cmyk_to_rgb(
            unpremultiply(c[0], c[4]),
            unpremultiply(c[1], c[4]),
            unpremultiply(c[2], c[4]),
            unpremultiply(c[3], c[4]),
            c[4],
        ),
    }
}

/// Encodes straight RGBA into one pixel of `fmt`
fn encode_pixel(fmt: PixelFormat, rgba: [f64; 4], bytes: &mut [u8]) {
    let [r, g, b, a] = rgba;
    let c: [f64; 5] = match fmt.model {
        ColorModel::Y => [luminance(r, g, b), 0.0, 0.0, 0.0, 0.0],
        ColorModel::Ya => [luminance(r, g, b), a, 0.0, 0.0, 0.0],
        ColorModel::YaPremul => [luminance(r, g, b) * a, a, 0.0, 0.0, 0.0],
        ColorModel::Rgb => [r, g, b, 0.0, 0.0],
        ColorModel::Rgba => [r, g, b, a, 0.0],
        ColorModel::RgbaPremul => [r * a, g * a, b * a, a, 0.0],
        ColorModel::Cmyk => {
            let [cc, m, y, k] = rgb_to_cmyk(r, g, b);
            [cc, m, y, k, 0.0]
        }
        ColorModel::Cmyka => {
            let [cc, m, y, k] = rgb_to_cmyk(r, g, b);
            [cc, m, y, k, a]
        }
        ColorModel::CmykaPremul => {
            let [cc, m, y, k] = rgb_to_cmyk(r, g, b);
            [cc * a, m * a, y * a, k * a, a]
        }
    };

    let size = fmt.component.size();
    for i in 0..fmt.components() {
        encode_component(fmt.component, c[i], &mut bytes[i * size..]);
    }
}

#[inline]
fn unpremultiply(value: f64, alpha: f64) -> f64 {
    if alpha == 0.0 {
        0.0
    } else {
        value / alpha
    }
}

#[inline]
fn luminance(r: f64, g: f64, b: f64) -> f64 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

fn cmyk_to_rgb(c: f64, m: f64, y: f64, k: f64, a: f64) -> [f64; 4] {
    [
        (1.0 - c) * (1.0 - k),
        (1.0 - m) * (1.0 - k),
        (1.0 - y) * (1.0 - k),
        a,
    ]
}

fn rgb_to_cmyk(r: f64, g: f64, b: f64) -> [f64; 4] {
    let k = 1.0 - r.max(g).max(b);
    if k >= 1.0 {
        return [0.0, 0.0, 0.0, 1.0];
    }
    let inv = 1.0 - k;
    [
        (1.0 - r - k) / inv,
        (1.0 - g - k) / inv,
        (1.0 - b - k) / inv,
        k,
    ]
}
