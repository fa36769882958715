//! Lohalo sampler
//!
//! Sigmoidized tensor Mitchell-Netravali blended with clamped-EWA
//! Robidoux. The tensor pass runs on sigmoidized color channels (alpha is
//! left alone); when the scale matrix actually downsamples, an elliptical
//! weighted average with the Robidoux Keys cubic is accumulated over the
//! bounding box of the clamped ellipse and blended in with weight
//! `1 − 1/(major·minor)`.

use std::sync::Arc;

use super::matrix::ClampedEllipse;
use super::{Matrix2, Sampler};
use crate::buffer::{AbyssPolicy, Buffer};

/// Half-width of the level-0 stencil; bounds EWA support to ~2× per axis
/// times this many pixels of downsampling.
pub const OFFSET: i32 = 13;
pub const SIZE: i32 = 1 + 2 * OFFSET;

/// Sigmoidal contrast tuned so enlarging one white pixel on black with
/// tensor Mitchell-Netravali conserves mass.
const CONTRAST: f64 = 3.38589;

fn sigmoidal(p: f64) -> f64 {
    (0.5 * CONTRAST * (p - 0.5)).tanh()
}

/// The standard sigmoidal extended with slope-matched straight lines
/// outside `[0, 1]`.
fn extended_sigmoidal(q: f32) -> f32 {
    let sig1 = sigmoidal(1.0);
    let slope = (1.0 / sig1 - sig1) * 0.25 * CONTRAST;
    let slope_times_q = slope as f32 * q;

    if q <= 0.0 {
        return slope_times_q;
    }
    if q >= 1.0 {
        return slope_times_q + (1.0 - slope) as f32;
    }
    let s = ((0.5 * CONTRAST) as f32 * q + (-0.25 * CONTRAST) as f32).tanh();
    (0.5 / sig1) as f32 * s + 0.5
}

fn inverse_sigmoidal(p: f32) -> f32 {
    let sig1 = sigmoidal(1.0);
    let slope = (1.0 / sig1 - sig1) * 0.25 * CONTRAST;
    let one_over_slope = 1.0 / slope;
    let p_over_slope = p * one_over_slope as f32;

    if p <= 0.0 {
        return p_over_slope;
    }
    if p >= 1.0 {
        return p_over_slope + (1.0 - one_over_slope) as f32;
    }
    let ssq = (2.0 * sig1) as f32 * p + (-sig1) as f32;
    (2.0 / CONTRAST) as f32 * ssq.atanh() + 0.5
}

/// A scaled Robidoux Keys cubic of the output-space distance; the scale
/// washes out in the weight normalization.
fn robidoux(c_major_x: f32, c_major_y: f32, c_minor_x: f32, c_minor_y: f32, s: f32, t: f32) -> f32 {
    let q1 = s * c_major_x + t * c_major_y;
    let q2 = s * c_minor_x + t * c_minor_y;
    let r2 = q1 * q1 + q2 * q2;

    if r2 >= 4.0 {
        return 0.0;
    }

    let r = r2.sqrt();
    let sqrt2 = std::f64::consts::SQRT_2;
    let minus_inner_root = ((-103.0 - 36.0 * sqrt2) / (7.0 + 72.0 * sqrt2)) as f32;
    let minus_outer_root = -2.0f32;
    let a3 = -3.0f32;
    let a2 = ((45739.0 + 7164.0 * sqrt2) / 10319.0) as f32;
    let a0 = ((-8926.0 + -14328.0 * sqrt2) / 10319.0) as f32;

    if r2 >= 1.0 {
        (r + minus_inner_root) * (r + minus_outer_root) * (r + minus_outer_root)
    } else {
        r2 * (a3 * r + a2) + a0
    }
}

pub(super) fn get(
    sampler: &mut Sampler,
    buffer: &Arc<Buffer>,
    absolute_x: f64,
    absolute_y: f64,
    scale: Option<&Matrix2>,
    dst: &mut [u8],
    policy: AbyssPolicy,
) {
    let channels = sampler.components;
    let row_skip = sampler.row_stride();

    // anchor at the closest pixel center (ties toward -infinity)
    let ix_0 = absolute_x.floor() as i32;
    let iy_0 = absolute_y.floor() as i32;

    let base = sampler.get_ptr(buffer, ix_0, iy_0, policy);
    let input = &sampler.levels[0].buffer;

    let x_0 = (absolute_x - 0.5 - ix_0 as f64) as f32;
    let y_0 = (absolute_y - 0.5 - iy_0 as f64) as f32;

    let sign_of_x_0: isize = if x_0 >= 0.0 { 1 } else { -1 };
    let sign_of_y_0: isize = if y_0 >= 0.0 { 1 } else { -1 };

    let shift_forw_1_pix = sign_of_x_0 * channels as isize;
    let shift_forw_1_row = sign_of_y_0 * row_skip as isize;
    let shift_back_1_pix = -shift_forw_1_pix;
    let shift_back_1_row = -shift_forw_1_row;
    let shift_forw_2_pix = 2 * shift_forw_1_pix;
    let shift_forw_2_row = 2 * shift_forw_1_row;

    let at = |shift: isize, c: usize| -> f32 { input[(base as isize + shift) as usize + c] };

    let col_shifts = [shift_back_1_pix, 0, shift_forw_1_pix, shift_forw_2_pix];
    let row_shifts = [shift_back_1_row, 0, shift_forw_1_row, shift_forw_2_row];

    // Mitchell-Netravali weights via the 13-flop grouping; coordinates are
    // reflected into [0, 1]
    let ax = x_0.abs();
    let ay = y_0.abs();
    let xt1 = (7.0 / 18.0) * ax;
    let yt1 = (7.0 / 18.0) * ay;
    let xt2 = 1.0 - ax;
    let yt2 = 1.0 - ay;
    let fou = (xt1 - 1.0 / 3.0) * ax * ax;
    let qua = (yt1 - 1.0 / 3.0) * ay * ay;
    let one = (1.0 / 18.0 - xt1) * xt2 * xt2;
    let uno = (1.0 / 18.0 - yt1) * yt2 * yt2;
    let xt3 = fou - one;
    let yt3 = qua - uno;
    let thr = ax - fou - xt3;
    let tre = ay - qua - yt3;
    let two = xt2 - one + xt3;
    let dos = yt2 - uno + yt3;

    let col_weights = [one, two, thr, fou];
    let row_weights = [uno, dos, tre, qua];

    let mut newval = [0.0f32; 5];

    // sigmoidize every channel except alpha
    for (c, value) in newval.iter_mut().enumerate().take(channels - 1) {
        let mut acc = 0.0f32;
        for (j, &row_w) in row_weights.iter().enumerate() {
            let mut line = 0.0f32;
            for (i, &col_w) in col_weights.iter().enumerate() {
                line += col_w * inverse_sigmoidal(at(row_shifts[j] + col_shifts[i], c));
            }
            acc += row_w * line;
        }
        *value = extended_sigmoidal(acc);
    }
    {
        let alpha = channels - 1;
        let mut acc = 0.0f32;
        for (j, &row_w) in row_weights.iter().enumerate() {
            let mut line = 0.0f32;
            for (i, &col_w) in col_weights.iter().enumerate() {
                line += col_w * at(row_shifts[j] + col_shifts[i], alpha);
            }
            acc += row_w * line;
        }
        newval[alpha] = acc;
    }

    let ellipse = ClampedEllipse::new(scale);
    if ellipse.needs_ewa {
        let theta = (1.0 / ellipse.ellipse_f) as f32;
        let (half_width, half_height) = ellipse.bounding_box(2.0);

        let out_left = ((x_0 - half_width as f32).ceil() as i32).max(-OFFSET);
        let out_rite = ((x_0 + half_width as f32).floor() as i32).min(OFFSET);
        let out_top = ((y_0 - half_height as f32).ceil() as i32).max(-OFFSET);
        let out_bot = ((y_0 + half_height as f32).floor() as i32).min(OFFSET);

        let c_major_x = ellipse.c_major_x as f32;
        let c_major_y = ellipse.c_major_y as f32;
        let c_minor_x = ellipse.c_minor_x as f32;
        let c_minor_y = ellipse.c_minor_y as f32;

        let mut total_weight = 0.0f64;
        let mut ewa_newval = [0.0f32; 5];

        for i in out_top..=out_bot {
            for j in out_left..=out_rite {
                let weight = robidoux(
                    c_major_x,
                    c_major_y,
                    c_minor_x,
                    c_minor_y,
                    x_0 - j as f32,
                    y_0 - i as f32,
                );
                total_weight += weight as f64;
                let shift = j as isize * channels as isize + i as isize * row_skip as isize;
                for (c, value) in ewa_newval.iter_mut().enumerate().take(channels) {
                    *value += weight * at(shift, c);
                }
            }
        }

        if total_weight != 0.0 {
            let beta = (1.0 - theta) / total_weight as f32;
            for c in 0..channels {
                newval[c] = theta * newval[c] + beta * ewa_newval[c];
            }
        }
    }

    sampler.ship_out(&newval[..channels], dst);
}

#[cfg(test)]
mod tests {
    use super::super::SamplerKind;
    use super::*;
    use crate::format::PixelFormat;
    use crate::rect::Rect;

    #[test]
    fn test_sigmoidal_round_trip() {
        for q in [-0.5f32, 0.0, 0.1, 0.5, 0.9, 1.0, 1.5] {
            let p = extended_sigmoidal(q);
            let back = inverse_sigmoidal(p);
            assert!((back - q).abs() < 1e-4, "q = {}, back = {}", q, back);
        }
    }

    #[test]
    fn test_sigmoidal_fixed_points() {
        assert!(extended_sigmoidal(0.0).abs() < 1e-6);
        assert!((extended_sigmoidal(1.0) - 1.0).abs() < 1e-6);
        assert!((extended_sigmoidal(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_robidoux_support() {
        // zero outside radius 2, continuous at the boundary
        assert_eq!(robidoux(1.0, 0.0, 0.0, 1.0, 2.5, 0.0), 0.0);
        let near_edge = robidoux(1.0, 0.0, 0.0, 1.0, 1.999, 0.0);
        assert!(near_edge.abs() < 1e-2);
        // center weight is the largest
        let center = robidoux(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        let off = robidoux(1.0, 0.0, 0.0, 1.0, 0.5, 0.5);
        assert!(center > off);
    }

    fn flat(value: u8) -> std::sync::Arc<Buffer> {
        let buffer =
            Buffer::with_tile_size(Rect::new(0, 0, 64, 64), PixelFormat::RGBA_U8, 32, 32);
        buffer.set_color_from_pixel(None, &[value, value, value, 255], PixelFormat::RGBA_U8);
        buffer
    }

    #[test]
    fn test_flat_field_identity() {
        let buffer = flat(120);
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Lohalo));
        let mut out = [0u8; 4];
        for (x, y) in [(32.5, 32.5), (30.3, 29.8), (40.9, 21.2)] {
            sampler.get(x, y, None, &mut out, AbyssPolicy::None);
            assert_eq!(out, [120, 120, 120, 255], "at ({}, {})", x, y);
        }
    }

    #[test]
    fn test_flat_field_under_downsampling() {
        let buffer = flat(77);
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Lohalo));
        let scale = Matrix2::new(3.0, 0.0, 0.0, 3.0);
        let mut out = [0u8; 4];
        sampler.get(32.0, 32.0, Some(&scale), &mut out, AbyssPolicy::None);
        // a constant image stays constant under any correct blend
        assert_eq!(out, [77, 77, 77, 255]);
    }

    #[test]
    fn test_downsampling_averages_checker() {
        // a fine checkerboard downsampled 4x approaches mid-gray
        let buffer =
            Buffer::with_tile_size(Rect::new(0, 0, 64, 64), PixelFormat::RGBA_U8, 32, 32);
        let mut data = vec![0u8; 64 * 64 * 4];
        for y in 0..64usize {
            for x in 0..64usize {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                data[(y * 64 + x) * 4..(y * 64 + x) * 4 + 4]
                    .copy_from_slice(&[v, v, v, 255]);
            }
        }
        buffer.set(&Rect::new(0, 0, 64, 64), 0, PixelFormat::RGBA_U8, &data, 64 * 4);

        let mut sampler = buffer.sampler(None, Some(SamplerKind::Lohalo));
        let scale = Matrix2::new(4.0, 0.0, 0.0, 4.0);
        let mut out = [0u8; 4];
        sampler.get(32.0, 32.0, Some(&scale), &mut out, AbyssPolicy::None);
        assert!(
            (out[0] as i32 - 128).abs() < 40,
            "expected near mid-gray, got {}",
            out[0]
        );
        assert_eq!(out[3], 255);
    }
}
