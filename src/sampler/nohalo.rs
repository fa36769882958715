//! Nohalo sampler
//!
//! One level of co-monotone (minmod-limited) subdivision refines the 2×2
//! cell around the sampling point, and a locally bounded bicubic evaluates
//! inside the refined cell; the construction is interpolatory and never
//! overshoots the local data range, so sharp edges stay halo-free. When
//! the scale matrix downsamples, a "teepee" (radial tent) elliptical
//! average over the clamped ellipse is blended in exactly as in lohalo.

use std::sync::Arc;

use super::matrix::ClampedEllipse;
use super::{Matrix2, Sampler};
use crate::buffer::{AbyssPolicy, Buffer};

pub const OFFSET: i32 = 13;
pub const SIZE: i32 = 1 + 2 * OFFSET;

/// minmod: the argument closer to zero, or zero on a sign change
#[inline]
fn minmod(a: f32, b: f32) -> f32 {
    if a * b <= 0.0 {
        0.0
    } else if a.abs() <= b.abs() {
        a
    } else {
        b
    }
}

/// Nohalo midpoint between `a` and `b` with outside neighbors `p` (before
/// `a`) and `q` (after `b`)
#[inline]
fn subdivide(p: f32, a: f32, b: f32, q: f32) -> f32 {
    0.5 * (a + b) + 0.125 * (minmod(b - a, a - p) - minmod(q - b, b - a))
}

/// Radial tent over the unit disk in output space
#[inline]
fn teepee(c_major_x: f32, c_major_y: f32, c_minor_x: f32, c_minor_y: f32, s: f32, t: f32) -> f32 {
    let q1 = s * c_major_x + t * c_major_y;
    let q2 = s * c_minor_x + t * c_minor_y;
    let r = (q1 * q1 + q2 * q2).sqrt();
    (1.0 - r).max(0.0)
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

    let ix_0 = absolute_x.floor() as i32;
    let iy_0 = absolute_y.floor() as i32;

    let base = sampler.get_ptr(buffer, ix_0, iy_0, policy);
    let input = &sampler.levels[0].buffer;

    // position relative to the anchor pixel center, in [-0.5, 0.5)
    let x_0 = (absolute_x - 0.5 - ix_0 as f64) as f32;
    let y_0 = (absolute_y - 0.5 - iy_0 as f64) as f32;

    // the cell between the anchor center and the neighbor the point leans
    // toward; (fx, fy) in [0, 1] measures position across that cell
    let sign_x: isize = if x_0 >= 0.0 { 1 } else { -1 };
    let sign_y: isize = if y_0 >= 0.0 { 1 } else { -1 };
    let fx = x_0.abs();
    let fy = y_0.abs();

    let pix = sign_x * channels as isize;
    let row = sign_y * row_skip as isize;

    let at = |dx: isize, dy: isize, c: usize| -> f32 {
        input[(base as isize + dx * pix + dy * row) as usize + c]
    };

    let mut newval = [0.0f32; 5];

    for (c, value) in newval.iter_mut().enumerate().take(channels) {
        // 4x4 stencil of the cell: rows/cols −1..=2 around the anchor in
        // the leaning direction
        let mut v = [[0.0f32; 4]; 4];
        for (j, row_vals) in v.iter_mut().enumerate() {
            for (i, val) in row_vals.iter_mut().enumerate() {
                *val = at(i as isize - 1, j as isize - 1, c);
            }
        }

        // one level of nohalo subdivision inside the center cell: two
        // horizontal midpoints, two vertical midpoints, one center
        let mid_top = subdivide(v[1][0], v[1][1], v[1][2], v[1][3]);
        let mid_bot = subdivide(v[2][0], v[2][1], v[2][2], v[2][3]);
        let mid_left = subdivide(v[0][1], v[1][1], v[2][1], v[3][1]);
        let mid_rite = subdivide(v[0][2], v[1][2], v[2][2], v[3][2]);
        let center = subdivide(mid_left, mid_top, mid_bot, mid_rite);

        // refined half-cell corner values: a 3x3 grid at spacing 1/2
        let refined = [
            [v[1][1], mid_top, v[1][2]],
            [mid_left, center, mid_rite],
            [v[2][1], mid_bot, v[2][2]],
        ];

        // locate the half-cell containing (fx, fy)
        let hx = if fx < 0.5 { 0 } else { 1 };
        let hy = if fy < 0.5 { 0 } else { 1 };
        let ux = 2.0 * fx - hx as f32;
        let uy = 2.0 * fy - hy as f32;

        let f00 = refined[hy][hx];
        let f10 = refined[hy][hx + 1];
        let f01 = refined[hy + 1][hx];
        let f11 = refined[hy + 1][hx + 1];

        // bounded bicubic finish: Hermite with minmod-limited derivatives,
        // clamped to the local subdivided values
        let dx00 = limited_slope(&refined, hy, hx, true);
        let dx10 = limited_slope(&refined, hy, hx + 1, true);
        let dx01 = limited_slope(&refined, hy + 1, hx, true);
        let dx11 = limited_slope(&refined, hy + 1, hx + 1, true);
        let dy00 = limited_slope(&refined, hy, hx, false);
        let dy10 = limited_slope(&refined, hy, hx + 1, false);
        let dy01 = limited_slope(&refined, hy + 1, hx, false);
        let dy11 = limited_slope(&refined, hy + 1, hx + 1, false);

        let top = hermite(f00, f10, dx00, dx10, ux);
        let bottom = hermite(f01, f11, dx01, dx11, ux);
        let left = hermite(f00, f01, dy00, dy01, uy);
        let right = hermite(f10, f11, dy10, dy11, uy);

        // blend the two directional passes; each is already bounded along
        // its axis
        let wx = hermite_weight(ux);
        let wy = hermite_weight(uy);
        let estimate = 0.5 * ((top + (bottom - top) * wy) + (left + (right - left) * wx));

        let lo = f00.min(f10).min(f01).min(f11);
        let hi = f00.max(f10).max(f01).max(f11);
        *value = estimate.clamp(lo, hi);
    }

    let ellipse = ClampedEllipse::new(scale);
    if ellipse.needs_ewa {
        let theta = (1.0 / ellipse.ellipse_f) as f32;
        let (half_width, half_height) = ellipse.bounding_box(1.0);

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
                let weight = teepee(
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
                    *value += weight * input[(base as isize + shift) as usize + c];
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

/// minmod-limited one-sided/central slope at a refined grid point, along
/// x (`horizontal`) or y, in half-cell units
fn limited_slope(refined: &[[f32; 3]; 3], y: usize, x: usize, horizontal: bool) -> f32 {
    let value = |dy: isize, dx: isize| -> Option<f32> {
        let ny = y as isize + dy;
        let nx = x as isize + dx;
        if (0..3).contains(&ny) && (0..3).contains(&nx) {
            Some(refined[ny as usize][nx as usize])
        } else {
            None
        }
    };

    let (prev, next) = if horizontal {
        (value(0, -1), value(0, 1))
    } else {
        (value(-1, 0), value(1, 0))
    };
    let here = refined[y][x];

    match (prev, next) {
        (Some(p), Some(n)) => minmod(here - p, n - here),
        (Some(p), None) => here - p,
        (None, Some(n)) => n - here,
        (None, None) => 0.0,
    }
}

/// Cubic Hermite along one axis with derivatives `d0`, `d1` at the ends
fn hermite(f0: f32, f1: f32, d0: f32, d1: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    f0 * (2.0 * t3 - 3.0 * t2 + 1.0)
        + f1 * (-2.0 * t3 + 3.0 * t2)
        + d0 * (t3 - 2.0 * t2 + t)
        + d1 * (t3 - t2)
}

/// The smoothstep blend used to mix the two directional Hermite passes
fn hermite_weight(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}
