//! Samplers: resampling at fractional coordinates
//!
//! A sampler turns floating-point buffer coordinates (corner convention:
//! pixel `(0, 0)` has its center at `(0.5, 0.5)`) into one output pixel
//! using a chosen interpolation scheme. Samplers are stateful: each owns a
//! small strip of source pixels per mipmap level, cached in a float
//! interpolation format chosen by the buffer's color model, and refetched
//! only when a request walks outside it. The fetch window grows in the
//! direction recent requests have been moving, which makes raster-order
//! traversals cheap.
//!
//! A sampler holds a weak reference to its buffer — it never keeps the
//! buffer alive — and revalidates its strips against the buffer's change
//! generation on every request.

pub mod cubic;
pub mod linear;
pub mod lohalo;
pub mod matrix;
pub mod nearest;
pub mod nohalo;

pub use matrix::Matrix2;

use std::sync::{Arc, Weak};

use crate::buffer::{AbyssPolicy, Buffer, SampleFilter};
use crate::format::{convert_pixels, PixelFormat};
use crate::rect::{remainder, Rect};

/// Working mipmap levels a sampler may cache
pub const MIPMAP_LEVELS: usize = 8;
/// Strip dimensions, in pixels
pub const MAXIMUM_WIDTH: i32 = 64;
pub const MAXIMUM_HEIGHT: i32 = 64;

/// The interpolation scheme of a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerKind {
    Nearest,
    #[default]
    Linear,
    Cubic,
    Nohalo,
    Lohalo,
}

pub(crate) struct SamplerLevel {
    pub context_rect: Rect,
    /// Cached strip, `MAXIMUM_WIDTH` floats-per-row stride; empty until
    /// first use
    pub buffer: Vec<f32>,
    /// Rect the strip covers; zero-sized when invalid
    pub rect: Rect,
    pub last_x: i32,
    pub last_y: i32,
    pub delta_x: f32,
    pub delta_y: f32,
}

impl SamplerLevel {
    fn new(context_rect: Rect) -> SamplerLevel {
        SamplerLevel {
            context_rect,
            buffer: Vec::new(),
            rect: Rect::default(),
            last_x: 0,
            last_y: 0,
            delta_x: 0.0,
            delta_y: 0.0,
        }
    }
}

#[derive(Clone, Copy)]
enum Method {
    Nearest,
    Linear,
    Cubic { b: f64, c: f64 },
    Nohalo,
    Lohalo,
}

pub struct Sampler {
    buffer: Weak<Buffer>,
    method: Method,
    /// Output format
    format: PixelFormat,
    pub(crate) interpolate_format: PixelFormat,
    pub(crate) components: usize,
    level_no: i32,
    pub(crate) levels: Vec<SamplerLevel>,
    abyss_rect: Rect,
    seen_generation: u64,
}

impl Buffer {
    /// Creates a sampler over this buffer. `format` defaults to the
    /// buffer's format; `kind` defaults to [`SamplerKind::Linear`].
    pub fn sampler(
        self: &Arc<Buffer>,
        format: Option<PixelFormat>,
        kind: Option<SamplerKind>,
    ) -> Sampler {
        self.sampler_at_level(format, kind, 0)
    }

    pub fn sampler_at_level(
        self: &Arc<Buffer>,
        format: Option<PixelFormat>,
        kind: Option<SamplerKind>,
        level: i32,
    ) -> Sampler {
        Sampler::new(self, format.unwrap_or_else(|| self.format()), kind.unwrap_or_default(), level)
    }

    /// One-shot sampling without keeping a sampler around
    #[allow(clippy::too_many_arguments)]
    pub fn sample_at_level(
        self: &Arc<Buffer>,
        x: f64,
        y: f64,
        scale: Option<&Matrix2>,
        dst: &mut [u8],
        format: Option<PixelFormat>,
        level: i32,
        kind: Option<SamplerKind>,
        policy: AbyssPolicy,
    ) {
        let kind = kind.unwrap_or_default();
        if kind == SamplerKind::Nearest && level == 0 {
            let format = format.unwrap_or_else(|| self.format());
            self.get(
                &Rect::new(x as i32, y as i32, 1, 1),
                1.0,
                Some(format),
                dst,
                format.bytes_per_pixel(),
                policy,
                SampleFilter::Auto,
            );
            return;
        }
        let mut sampler = self.sampler_at_level(format, Some(kind), level);
        sampler.get(x, y, scale, dst, policy);
    }
}

impl Sampler {
    fn new(buffer: &Arc<Buffer>, format: PixelFormat, kind: SamplerKind, level: i32) -> Sampler {
        let interpolate_format = buffer.format().interpolation_format();
        let components = interpolate_format.components();

        let (method, context_rect) = match kind {
            SamplerKind::Nearest => (Method::Nearest, Rect::new(0, 0, 1, 1)),
            SamplerKind::Linear => (Method::Linear, Rect::new(-1, -1, 3, 3)),
            SamplerKind::Cubic => (
                Method::Cubic {
                    b: cubic::DEFAULT_B,
                    c: cubic::keys_c(cubic::DEFAULT_B),
                },
                Rect::new(-2, -2, 5, 5),
            ),
            SamplerKind::Nohalo => (
                Method::Nohalo,
                Rect::new(-nohalo::OFFSET, -nohalo::OFFSET, nohalo::SIZE, nohalo::SIZE),
            ),
            SamplerKind::Lohalo => (
                Method::Lohalo,
                Rect::new(-lohalo::OFFSET, -lohalo::OFFSET, lohalo::SIZE, lohalo::SIZE),
            ),
        };

        // clamp sampling coordinates so that the context rect around them
        // stays in the neighborhood of valid data
        let abyss = buffer.abyss();
        let abyss_rect = Rect::new(
            abyss.x - (context_rect.x + context_rect.width),
            abyss.y - (context_rect.y + context_rect.height),
            abyss.width + context_rect.width + 1,
            abyss.height + context_rect.height + 1,
        );

        let levels = (0..MIPMAP_LEVELS)
            .map(|_| SamplerLevel::new(context_rect))
            .collect();

        Sampler {
            buffer: Arc::downgrade(buffer),
            method,
            format,
            interpolate_format,
            components,
            level_no: level,
            levels,
            abyss_rect,
            seen_generation: buffer.generation(),
        }
    }

    /// Overrides the cubic spline parameters; ignored for other kinds
    pub fn set_cubic_parameters(&mut self, b: f64, c: f64) {
        if let Method::Cubic { b: pb, c: pc } = &mut self.method {
            *pb = b;
            *pc = c;
        }
    }

    pub fn context_rect(&self) -> Rect {
        self.levels[0].context_rect
    }

    /// Samples at `(x, y)` into `dst` in the sampler's output format.
    ///
    /// `scale` is the inverse Jacobian of the output→input mapping at the
    /// location, used by the downsampling filters; `None` means identity.
    pub fn get(
        &mut self,
        x: f64,
        y: f64,
        scale: Option<&Matrix2>,
        dst: &mut [u8],
        policy: AbyssPolicy,
    ) {
        let x = if x.is_finite() { x } else { 0.0 };
        let y = if y.is_finite() { y } else { 0.0 };

        let Some(buffer) = self.buffer.upgrade() else {
            // the buffer is gone; there is nothing to sample
            dst[..self.format.bytes_per_pixel()].fill(0);
            return;
        };

        // any change invalidates every cached strip
        let generation = buffer.generation();
        if generation != self.seen_generation {
            self.invalidate();
            self.seen_generation = generation;
        }

        if self.level_no != 0 {
            let factor = 1.0 / (1i64 << self.level_no) as f64;
            let rect = Rect::new((x * factor).floor() as i32, (y * factor).floor() as i32, 1, 1);
            buffer.get(
                &rect,
                factor,
                Some(self.format),
                dst,
                self.format.bytes_per_pixel(),
                policy,
                SampleFilter::Auto,
            );
            return;
        }

        match self.method {
            Method::Nearest => nearest::get(self, &buffer, x, y, dst, policy),
            Method::Linear => linear::get(self, &buffer, x, y, scale, dst, policy),
            Method::Cubic { b, c } => cubic::get(self, &buffer, x, y, scale, dst, policy, b, c),
            Method::Nohalo => nohalo::get(self, &buffer, x, y, scale, dst, policy),
            Method::Lohalo => lohalo::get(self, &buffer, x, y, scale, dst, policy),
        }
    }

    pub(crate) fn invalidate(&mut self) {
        for level in self.levels.iter_mut() {
            level.rect = Rect::default();
        }
    }

    pub(crate) fn output_format(&self) -> PixelFormat {
        self.format
    }

    /// Converts one pixel from the interpolation format to the output
    pub(crate) fn ship_out(&self, result: &[f32], dst: &mut [u8]) {
        let bytes = unsafe {
            std::slice::from_raw_parts(result.as_ptr().cast::<u8>(), result.len() * 4)
        };
        convert_pixels(self.interpolate_format, self.format, bytes, dst, 1);
    }

    /// Row stride of the cached strips, in f32 units
    pub(crate) fn row_stride(&self) -> usize {
        MAXIMUM_WIDTH as usize * self.components
    }

    fn compute_rectangle(&self, level_no: usize, x: i32, y: i32) -> Rect {
        let level = &self.levels[level_no];
        let mut width = level.context_rect.width + 2;
        let mut height = level.context_rect.height + 2;

        // grow in the direction of the recent movement
        if level.delta_x * level.delta_x > level.delta_y * level.delta_y {
            width *= 2;
        } else {
            height *= 2;
        }

        let mut rect = Rect::new(
            x + level.context_rect.x - 1,
            y + level.context_rect.y - 1,
            width + 2,
            height + 2,
        );

        // shift the window along the predicted direction
        if level.delta_x >= 0.01 {
            rect.x -= (rect.width as f32 * 0.3) as i32;
        }
        if level.delta_y >= 0.01 {
            rect.y -= (rect.height as f32 * 0.3) as i32;
        }

        rect.width = rect.width.min(MAXIMUM_WIDTH).max(level.context_rect.width);
        rect.height = rect.height.min(MAXIMUM_HEIGHT).max(level.context_rect.height);
        rect
    }

    fn strip_covers(&self, level_no: usize, x: i32, y: i32) -> bool {
        let level = &self.levels[level_no];
        let ctx = level.context_rect;
        !(x + ctx.x < level.rect.x
            || y + ctx.y < level.rect.y
            || x + ctx.x + ctx.width > level.rect.x + level.rect.width
            || y + ctx.y + ctx.height > level.rect.y + level.rect.height)
    }

    fn fetch_strip(
        &mut self,
        buffer: &Buffer,
        level_no: usize,
        rect: Rect,
        policy: AbyssPolicy,
    ) {
        let components = self.components;
        let level = &mut self.levels[level_no];
        if level.buffer.is_empty() {
            level.buffer = vec![0.0; (MAXIMUM_WIDTH * MAXIMUM_HEIGHT) as usize * components];
        }
        let interpolate_format = self.interpolate_format;
        let stride_bytes = MAXIMUM_WIDTH as usize * interpolate_format.bytes_per_pixel();
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                level.buffer.as_mut_ptr().cast::<u8>(),
                level.buffer.len() * 4,
            )
        };
        let scale = 1.0 / (1i64 << level_no) as f64;
        buffer.get(
            &rect,
            scale,
            Some(interpolate_format),
            bytes,
            stride_bytes,
            policy,
            SampleFilter::Auto,
        );
        level.rect = rect;
    }

    /// Ensures the level-0 strip covers the context around `(x, y)` and
    /// returns the f32 index of that pixel's first component.
    pub(crate) fn get_ptr(
        &mut self,
        buffer: &Buffer,
        x: i32,
        y: i32,
        policy: AbyssPolicy,
    ) -> usize {
        let (mut x, mut y) = (x, y);
        if policy != AbyssPolicy::Loop {
            x = x.clamp(self.abyss_rect.x, self.abyss_rect.x + self.abyss_rect.width - 1);
            y = y.clamp(self.abyss_rect.y, self.abyss_rect.y + self.abyss_rect.height - 1);
        } else {
            let abyss = buffer.abyss();
            if !abyss.is_empty() {
                x = abyss.x + remainder(x - abyss.x, abyss.width);
                y = abyss.y + remainder(y - abyss.y, abyss.height);
            }
        }

        if !self.strip_covers(0, x, y) {
            let rect = self.compute_rectangle(0, x, y);
            self.fetch_strip(buffer, 0, rect, policy);
            let level = &mut self.levels[0];
            level.last_x = x;
            level.last_y = y;
            level.delta_x = 0.0;
            level.delta_y = 0.0;
        }

        let stride = self.row_stride();
        let level = &mut self.levels[0];
        let delta_x = (level.last_x - x) as f32;
        let delta_y = (level.last_y - y) as f32;
        level.last_x = x;
        level.last_y = y;
        level.delta_x = (level.delta_x + delta_x) / 2.0;
        level.delta_y = (level.delta_y + delta_y) / 2.0;

        ((y - level.rect.y) as usize) * stride
            + ((x - level.rect.x) as usize) * self.components
    }

    /// Shared downsampling helper for the interpolating samplers: when the
    /// scale matrix calls for at least 2× downsampling on either axis,
    /// average a grid of point samples taken by `interpolate`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn box_get(
        &mut self,
        buffer: &Arc<Buffer>,
        x: f64,
        y: f64,
        scale: Option<&Matrix2>,
        dst: &mut [u8],
        policy: AbyssPolicy,
        max_n_samples: i32,
        interpolate: fn(&mut Sampler, &Arc<Buffer>, f64, f64, &mut [f32], AbyssPolicy),
    ) -> bool {
        let Some(scale) = scale else { return false };

        let u_norm2 =
            scale.coeff[0][0] * scale.coeff[0][0] + scale.coeff[1][0] * scale.coeff[1][0];
        let v_norm2 =
            scale.coeff[0][1] * scale.coeff[0][1] + scale.coeff[1][1] * scale.coeff[1][1];
        if u_norm2 < 4.0 && v_norm2 < 4.0 {
            return false;
        }

        let channels = self.components;
        let mut result = [0.0f32; 5];
        let mut sample = [0.0f32; 5];

        let (u_dx, u_dy, v_dx, v_dy, u_samples, v_samples);
        if scale.is_scale() {
            let u_norm = scale.coeff[0][0].abs();
            let v_norm = scale.coeff[1][1].abs();
            u_samples = (u_norm.floor() as i32).clamp(1, max_n_samples);
            v_samples = (v_norm.floor() as i32).clamp(1, max_n_samples);
            u_dx = scale.coeff[0][0] / u_samples as f64;
            u_dy = 0.0;
            v_dx = 0.0;
            v_dy = scale.coeff[1][1] / v_samples as f64;
        } else {
            let u_norm = u_norm2.sqrt();
            let v_norm = v_norm2.sqrt();
            u_samples = (u_norm.floor() as i32).clamp(1, max_n_samples);
            v_samples = (v_norm.floor() as i32).clamp(1, max_n_samples);
            u_dx = scale.coeff[0][0] / u_samples as f64;
            u_dy = scale.coeff[1][0] / u_samples as f64;
            v_dx = scale.coeff[0][1] / v_samples as f64;
            v_dy = scale.coeff[1][1] / v_samples as f64;
        }

        let mut x0 = x - (scale.coeff[0][0] - u_dx + scale.coeff[0][1] - v_dx) / 2.0;
        let mut y0 = y - (scale.coeff[1][0] - u_dy + scale.coeff[1][1] - v_dy) / 2.0;

        for _ in 0..v_samples {
            let mut sx = x0;
            let mut sy = y0;
            for _ in 0..u_samples {
                interpolate(self, buffer, sx, sy, &mut sample, policy);
                for c in 0..channels {
                    result[c] += sample[c];
                }
                sx += u_dx;
                sy += u_dy;
            }
            x0 += v_dx;
            y0 += v_dy;
        }

        let inv = 1.0 / (u_samples as f32 * v_samples as f32);
        for value in result.iter_mut().take(channels) {
            *value *= inv;
        }

        self.ship_out(&result[..channels], dst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: i32, height: i32) -> Arc<Buffer> {
        let buffer = Buffer::with_tile_size(
            Rect::new(0, 0, width, height),
            PixelFormat::RGBA_U8,
            32,
            32,
        );
        let mut data = vec![0u8; (width * height * 4) as usize];
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 4) as usize;
                data[i] = (x * 8) as u8;
                data[i + 1] = (y * 8) as u8;
                data[i + 2] = 0;
                data[i + 3] = 255;
            }
        }
        buffer.set(
            &Rect::new(0, 0, width, height),
            0,
            PixelFormat::RGBA_U8,
            &data,
            (width * 4) as usize,
        );
        buffer
    }

    #[test]
    fn test_default_kind_is_linear() {
        assert_eq!(SamplerKind::default(), SamplerKind::Linear);
    }

    #[test]
    fn test_context_rects() {
        let buffer = gradient(16, 16);
        assert_eq!(
            buffer.sampler(None, Some(SamplerKind::Nearest)).context_rect(),
            Rect::new(0, 0, 1, 1)
        );
        assert_eq!(
            buffer.sampler(None, Some(SamplerKind::Linear)).context_rect(),
            Rect::new(-1, -1, 3, 3)
        );
        assert_eq!(
            buffer.sampler(None, Some(SamplerKind::Cubic)).context_rect(),
            Rect::new(-2, -2, 5, 5)
        );
        assert_eq!(
            buffer.sampler(None, Some(SamplerKind::Lohalo)).context_rect(),
            Rect::new(-13, -13, 27, 27)
        );
        assert_eq!(
            buffer.sampler(None, Some(SamplerKind::Nohalo)).context_rect(),
            Rect::new(-13, -13, 27, 27)
        );
    }

    #[test]
    fn test_weak_buffer_reference() {
        let buffer = gradient(16, 16);
        let mut sampler = buffer.sampler(None, None);
        drop(buffer);
        let mut out = [1u8; 4];
        sampler.get(5.0, 5.0, None, &mut out, AbyssPolicy::None);
        assert_eq!(out, [0, 0, 0, 0]);
    }

    #[test]
    fn test_change_invalidates_strip() {
        let buffer = gradient(16, 16);
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Nearest));
        let mut before = [0u8; 4];
        sampler.get(4.5, 4.5, None, &mut before, AbyssPolicy::None);
        assert_eq!(before, [32, 32, 0, 255]);

        buffer.set(
            &Rect::new(4, 4, 1, 1),
            0,
            PixelFormat::RGBA_U8,
            &[9, 9, 9, 9],
            4,
        );
        let mut after = [0u8; 4];
        sampler.get(4.5, 4.5, None, &mut after, AbyssPolicy::None);
        assert_eq!(after, [9, 9, 9, 9]);
    }

    #[test]
    fn test_strip_reuse_in_raster_order() {
        let buffer = gradient(64, 64);
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Linear));
        // scan a row; results must match fresh point queries
        for x in 1..40 {
            let mut out = [0u8; 4];
            sampler.get(x as f64 + 0.5, 10.5, None, &mut out, AbyssPolicy::None);
            assert_eq!(out[0], (x * 8) as u8, "x = {}", x);
            assert_eq!(out[1], 80);
        }
    }

    #[test]
    fn test_sample_at_level_nearest_shortcut() {
        let buffer = gradient(16, 16);
        let mut out = [0u8; 4];
        buffer.sample_at_level(
            3.0,
            2.0,
            None,
            &mut out,
            None,
            0,
            Some(SamplerKind::Nearest),
            AbyssPolicy::None,
        );
        assert_eq!(out, [24, 16, 0, 255]);
    }

    #[test]
    fn test_nan_coordinates_forced_to_zero() {
        let buffer = gradient(16, 16);
        let mut sampler = buffer.sampler(None, Some(SamplerKind::Nearest));
        let mut out = [0u8; 4];
        sampler.get(f64::NAN, f64::INFINITY, None, &mut out, AbyssPolicy::None);
        assert_eq!(out, [0, 0, 0, 255]);
    }
}
