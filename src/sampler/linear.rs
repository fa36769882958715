//! Bilinear sampler

use std::sync::Arc;

use super::Sampler;
use crate::buffer::{AbyssPolicy, Buffer};

pub(super) fn get(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    x: f64,
    y: f64,
    scale: Option<&super::Matrix2>,
    dst: &mut [u8],
    policy: AbyssPolicy,
) {
    if sampler.box_get(buffer, x, y, scale, dst, policy, 4, interpolate) {
        return;
    }
    let mut result = [0.0f32; 5];
    interpolate(sampler, buffer, x, y, &mut result, policy);
    let channels = sampler.components;
    sampler.ship_out(&result[..channels], dst);
}

/// Point-samples with bilinear weights into the interpolation format
pub(super) fn interpolate(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    absolute_x: f64,
    absolute_y: f64,
    output: &mut [f32],
    policy: AbyssPolicy,
) {
    let channels = sampler.components;

    // shift into the center-based frame: we want the pixel above and to
    // the left of the sampling location
    let iabsolute_x = absolute_x - 0.5;
    let iabsolute_y = absolute_y - 0.5;
    let ix = iabsolute_x.floor() as i32;
    let iy = iabsolute_y.floor() as i32;

    let base = sampler.get_ptr(buffer, ix, iy, policy);
    let stride = sampler.row_stride();
    let data = &sampler.levels[0].buffer;

    let fx = (iabsolute_x - ix as f64) as f32;
    let fy = (iabsolute_y - iy as f64) as f32;

    let x_times_y = fx * fy;
    let w_times_y = fy - x_times_y;
    let x_times_z = fx - x_times_y;
    let w_times_z = 1.0 - (fx + w_times_y);

    for c in 0..channels {
        let top_left = data[base + c];
        let top_rite = data[base + channels + c];
        let bot_left = data[base + stride + c];
        let bot_rite = data[base + stride + channels + c];
        output[c] = x_times_y * bot_rite
            + w_times_y * bot_left
            + x_times_z * top_rite
            + w_times_z * top_left;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Matrix2, SamplerKind};
    use crate::buffer::{AbyssPolicy, Buffer};
    use crate::format::PixelFormat;
    use crate::rect::Rect;
    use std::sync::Arc;

    fn ramp() -> Arc<Buffer> {
        // horizontal ramp 0, 100, 200 in the red channel
        let buffer =
            Buffer::with_tile_size(Rect::new(0, 0, 4, 4), PixelFormat::RGBA_U8, 32, 32);
        let mut data = vec![0u8; 4 * 4 * 4];
        for y in 0..4usize {
            for x in 0..4usize {
                data[(y * 4 + x) * 4] = (x * 60) as u8;
                data[(y * 4 + x) * 4 + 3] = 255;
            }
        }
        buffer.set(&Rect::new(0, 0, 4, 4), 0, PixelFormat::RGBA_U8, &data, 16);
        buffer
    }

    #[test]
    fn test_pixel_centers_exact() {
        let buffer = ramp();
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Linear));
        let mut out = [0u8; 4];
        for x in 0..4 {
            sampler.get(x as f64 + 0.5, 1.5, None, &mut out, AbyssPolicy::None);
            assert_eq!(out[0], (x * 60) as u8);
            assert_eq!(out[3], 255);
        }
    }

    #[test]
    fn test_midpoint_averages() {
        let buffer = ramp();
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Linear));
        let mut out = [0u8; 4];
        sampler.get(2.0, 1.5, None, &mut out, AbyssPolicy::None);
        // halfway between 60 and 120
        assert_eq!(out[0], 90);
    }

    #[test]
    fn test_box_get_kicks_in_for_downscale() {
        let buffer = ramp();
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Linear));
        let mut out = [0u8; 4];
        let scale = Matrix2::new(4.0, 0.0, 0.0, 4.0);
        sampler.get(2.0, 2.0, Some(&scale), &mut out, AbyssPolicy::None);
        // average over most of the ramp, clamped by the abyss; the result
        // must sit strictly between the extremes
        assert!(out[0] > 30 && out[0] < 150, "got {}", out[0]);
        assert_eq!(out[3], 255);
    }
}
