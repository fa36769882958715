//! Cubic (Keys BC-spline) sampler
//!
//! A 4×4 tensor filter parameterized by `(b, c)`. The default `b = 0.5`
//! sits between the sharp-but-ringing `b = 0` and the fuzzy `b = 1`
//! extremes, and `c` is derived so the spline stays in the Keys family
//! (`b + 2c = 1`).

use std::sync::Arc;

use super::Sampler;
use crate::buffer::{AbyssPolicy, Buffer};

pub const DEFAULT_B: f64 = 0.5;

/// The Keys-family `c` for a given `b`
pub fn keys_c(b: f64) -> f64 {
    0.5 * (1.0 - b)
}

#[allow(clippy::too_many_arguments)]
pub(super) fn get(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    x: f64,
    y: f64,
    scale: Option<&super::Matrix2>,
    dst: &mut [u8],
    policy: AbyssPolicy,
    b: f64,
    c: f64,
) {
    if sampler.box_get(buffer, x, y, scale, dst, policy, 5, interpolate) {
        return;
    }
    let mut result = [0.0f32; 5];
    interpolate_bc(sampler, buffer, x, y, &mut result, policy, b as f32, c as f32);
    let channels = sampler.components;
    sampler.ship_out(&result[..channels], dst);
}

/// Box-get callback: point sampling with the default spline
pub(super) fn interpolate(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    x: f64,
    y: f64,
    output: &mut [f32],
    policy: AbyssPolicy,
) {
    interpolate_bc(
        sampler,
        buffer,
        x,
        y,
        output,
        policy,
        DEFAULT_B as f32,
        keys_c(DEFAULT_B) as f32,
    );
}

#[allow(clippy::too_many_arguments)]
fn interpolate_bc(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    absolute_x: f64,
    absolute_y: f64,
    output: &mut [f32],
    policy: AbyssPolicy,
    b: f32,
    c: f32,
) {
    let channels = sampler.components;

    let iabsolute_x = absolute_x - 0.5;
    let iabsolute_y = absolute_y - 0.5;
    let ix = iabsolute_x.floor() as i32;
    let iy = iabsolute_y.floor() as i32;

    let anchor = sampler.get_ptr(buffer, ix, iy, policy);
    let stride = sampler.row_stride();
    let data = &sampler.levels[0].buffer;

    // the 4x4 stencil starts one pixel up and left of the anchor
    let base = anchor - stride - channels;

    let fx = (iabsolute_x - ix as f64) as f32;
    let fy = (iabsolute_y - iy as f64) as f32;

    let mut factor_i = [0.0f32; 4];
    for (i, factor) in factor_i.iter_mut().enumerate() {
        *factor = cubic_kernel(fx - (i as f32 - 1.0), b, c);
    }

    output[..channels].fill(0.0);

    for j in 0..4 {
        let factor_j = cubic_kernel(fy - (j as f32 - 1.0), b, c);
        let row = base + j * stride;
        for (i, &factor) in factor_i.iter().enumerate() {
            let weight = factor_j * factor;
            let px = row + i * channels;
            for ch in 0..channels {
                output[ch] += weight * data[px + ch];
            }
        }
    }
}

/// The BC-spline kernel
fn cubic_kernel(t: f32, b: f32, c: f32) -> f32 {
    let t2 = t * t;
    let at = t.abs();

    if t2 <= 1.0 {
        ((12.0 - 9.0 * b - 6.0 * c) / 6.0 * at + (-18.0 + 12.0 * b + 6.0 * c) / 6.0) * t2
            + (6.0 - 2.0 * b) / 6.0
    } else if t2 < 4.0 {
        ((-b - 6.0 * c) / 6.0 * at + (6.0 * b + 30.0 * c) / 6.0) * t2
            + (-12.0 * b - 48.0 * c) / 6.0 * at
            + (8.0 * b + 24.0 * c) / 6.0
    } else {
        0.0
    }
}
