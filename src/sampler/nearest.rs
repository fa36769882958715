//! Nearest-neighbor sampler

use std::sync::Arc;

use super::Sampler;
use crate::buffer::{AbyssPolicy, Buffer};

pub(super) fn get(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    x: f64,
    y: f64,
    dst: &mut [u8],
    policy: AbyssPolicy,
) {
    buffer.get_pixel(
        x.floor() as i32,
        y.floor() as i32,
        sampler.output_format(),
        dst,
        policy,
    );
}

#[cfg(test)]
mod tests {
    use super::super::SamplerKind;
    use crate::buffer::{AbyssPolicy, Buffer};
    use crate::format::PixelFormat;
    use crate::rect::Rect;

    fn checker() -> std::sync::Arc<Buffer> {
        let buffer =
            Buffer::with_tile_size(Rect::new(0, 0, 4, 4), PixelFormat::RGBA_U8, 32, 32);
        let mut data = vec![0u8; 4 * 4 * 4];
        for y in 0..4usize {
            for x in 0..4usize {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                data[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4]
                    .copy_from_slice(&[v, v, v, 255]);
            }
        }
        buffer.set(&Rect::new(0, 0, 4, 4), 0, PixelFormat::RGBA_U8, &data, 16);
        buffer
    }

    #[test]
    fn test_picks_containing_pixel() {
        let buffer = checker();
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Nearest));
        let mut out = [0u8; 4];
        // anywhere inside pixel (0,0)
        sampler.get(0.1, 0.9, None, &mut out, AbyssPolicy::None);
        assert_eq!(out[0], 255);
        sampler.get(1.9, 0.1, None, &mut out, AbyssPolicy::None);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_abyss_policies() {
        let buffer = checker();
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Nearest));
        let mut out = [0u8; 4];
        sampler.get(-3.0, 0.5, None, &mut out, AbyssPolicy::None);
        assert_eq!(out, [0, 0, 0, 0]);
        sampler.get(-3.0, 0.5, None, &mut out, AbyssPolicy::Clamp);
        assert_eq!(out, [255, 255, 255, 255]);
        sampler.get(-3.0, 0.5, None, &mut out, AbyssPolicy::White);
        assert_eq!(out, [255, 255, 255, 255]);
        sampler.get(4.5, 0.5, None, &mut out, AbyssPolicy::Loop);
        assert_eq!(out[0], 255); // wraps to column 0
    }
}
