//! Rectangle write path
//!
//! Writes walk the tiles covered by the request, write-lock each (which
//! performs the COW unshare), clip the incoming rows against the abyss,
//! and copy or convert the bytes in. Tiles fully covered by the request
//! are fetched in discard mode so their previous contents are never
//! produced. Damage is recorded once for the whole rectangle rather than
//! per tile.

use std::sync::Arc;

use super::{Buffer, SetFlags};
use crate::error::Error;
use crate::format::{convert_pixels, convert_rows, PixelFormat};
use crate::ops;
use crate::rect::{tile_index, tile_offset, Rect};

impl Buffer {
    /// Writes `src` into `rect` at mipmap `level`, converting from
    /// `format`. `rowstride` of zero means tightly packed. The public
    /// entry locks the buffer and notifies.
    pub fn set(
        &self,
        rect: &Rect,
        level: i32,
        format: PixelFormat,
        src: &[u8],
        rowstride: usize,
    ) {
        self.set_with_flags(rect, level, format, src, rowstride, SetFlags::FULL);
    }

    /// Internal fast setter: no lock, no notification
    pub(crate) fn set_unlocked_no_notify(
        &self,
        rect: &Rect,
        level: i32,
        format: PixelFormat,
        src: &[u8],
        rowstride: usize,
    ) {
        self.set_with_flags(rect, level, format, src, rowstride, SetFlags::FAST);
    }

    pub fn set_with_flags(
        &self,
        rect: &Rect,
        level: i32,
        format: PixelFormat,
        src: &[u8],
        rowstride: usize,
        flags: SetFlags,
    ) {
        if rect.is_empty() {
            return;
        }

        if flags.lock {
            self.lock();
        }

        if level == 0 && rect.width == 1 && rect.height == 1 {
            self.set_pixel(rect.x, rect.y, format, src);
        } else {
            self.iterate_write(rect, src, rowstride, format, level);
        }

        self.mark_initialized();

        if self.is_shared() {
            self.flush();
        }

        if flags.lock {
            self.unlock();
        }
        if flags.notify {
            self.emit_changed(rect);
        }
    }

    /// Single-pixel write through the hot tile
    fn set_pixel(&self, x: i32, y: i32, format: PixelFormat, src: &[u8]) {
        let abyss = self.abyss();
        if !abyss.contains_point(x, y) {
            return;
        }

        let storage = self.storage();
        let tile_width = storage.tile_width;
        let tile_height = storage.tile_height;
        let tiled_x = x + self.shift_x();
        let tiled_y = y + self.shift_y();
        let index_x = tile_index(tiled_x, tile_width);
        let index_y = tile_index(tiled_y, tile_height);

        let tile = match storage.steal_hot_tile() {
            Some((hx, hy, hz, tile)) if (hx, hy, hz) == (index_x, index_y, 0) => tile,
            other => {
                drop(other);
                match storage.get_tile(index_x, index_y, 0) {
                    Some(tile) => tile,
                    None => {
                        log::warn!(
                            "{}, dropping pixel write",
                            Error::TileFetchMiss(index_x, index_y, 0)
                        );
                        return;
                    }
                }
            }
        };

        {
            let soft_format = self.format();
            let px_size = soft_format.bytes_per_pixel();
            let offset_x = tiled_x - index_x * tile_width;
            let offset_y = tiled_y - index_y * tile_height;

            tile.lock();
            let data = tile.data_mut();
            let start = (offset_y * tile_width + offset_x) as usize * px_size;
            if format != soft_format {
                convert_pixels(
                    format,
                    soft_format,
                    src,
                    &mut data[start..start + px_size],
                    1,
                );
            } else {
                data[start..start + px_size].copy_from_slice(&src[..px_size]);
            }
            tile.unlock_no_void();
        }

        // a stolen hot tile may have fallen out of the cache meanwhile
        if !storage.cache().contains(index_x, index_y, 0) {
            storage.set_tile(index_x, index_y, 0, Arc::clone(&tile));
        }
        storage.damage_rect(&Rect::new(tiled_x, tiled_y, 1, 1));
        storage.take_hot_tile(index_x, index_y, 0, tile);
    }

    /// The per-tile write loop
    fn iterate_write(
        &self,
        roi: &Rect,
        src: &[u8],
        rowstride: usize,
        format: PixelFormat,
        level: i32,
    ) {
        let storage = self.storage();
        let tile_width = storage.tile_width;
        let tile_height = storage.tile_height;
        // tile bytes are interpreted through the advertised (soft) format
        let soft_format = self.format();
        let px_size = soft_format.bytes_per_pixel();
        let bpx_size = format.bytes_per_pixel();
        let tile_stride = px_size * tile_width as usize;
        let same_format = format == soft_format;

        let factor = 1i32 << level;

        // the roi arrives in level coordinates; the abyss scales down
        let buffer_shift_x = self.shift_x();
        let buffer_shift_y = self.shift_y();
        let abyss = self.abyss();
        let mut buffer_abyss_x = abyss.x + buffer_shift_x;
        let mut buffer_abyss_y = abyss.y + buffer_shift_y;
        let mut abyss_x_total = buffer_abyss_x + abyss.width;
        let mut abyss_y_total = buffer_abyss_y + abyss.height;

        let scaled_roi = if level != 0 {
            Rect::new(
                roi.x << level,
                roi.y << level,
                roi.width << level,
                roi.height << level,
            )
        } else {
            *roi
        };

        let mut buffer_x = scaled_roi.x + buffer_shift_x;
        let mut buffer_y = scaled_roi.y + buffer_shift_y;
        let mut width = scaled_roi.width;
        let mut height = scaled_roi.height;

        buffer_abyss_x /= factor;
        buffer_abyss_y /= factor;
        abyss_x_total /= factor;
        abyss_y_total /= factor;
        buffer_x /= factor;
        buffer_y /= factor;
        width /= factor;
        height /= factor;

        let buf_stride = if rowstride == 0 {
            width as usize * bpx_size
        } else {
            rowstride
        };

        let mut buf_y = 0;
        while buf_y < height {
            let tiled_y = buffer_y + buf_y;
            let offset_y = tile_offset(tiled_y, tile_height);
            let mut buf_x = 0;

            while buf_x < width {
                let tiled_x = buffer_x + buf_x;
                let offset_x = tile_offset(tiled_x, tile_width);
                let index_x = tile_index(tiled_x, tile_width);
                let index_y = tile_index(tiled_y, tile_height);

                let mut pixels = if width + offset_x - buf_x < tile_width {
                    width - buf_x
                } else {
                    tile_width - offset_x
                };

                // horizontal clip against the abyss
                let mut lskip = buffer_abyss_x - (buffer_x + buf_x);
                let mut rskip = (buffer_x + buf_x + pixels) - abyss_x_total;
                lskip = lskip.clamp(0, pixels);
                rskip = rskip.clamp(0, pixels);
                pixels -= lskip;
                pixels -= rskip;

                let whole_tile = pixels == tile_width
                    && buf_y >= buffer_abyss_y - buffer_y
                    && (height - buf_y)
                        .min(tile_height - offset_y)
                        .min(abyss_y_total - (buffer_y + buf_y))
                        == tile_height;

                let tile = {
                    let _guard = storage.lock();
                    if whole_tile {
                        storage.get_tile_discard(index_x, index_y, level)
                    } else {
                        storage.get_tile(index_x, index_y, level)
                    }
                };
                let Some(tile) = tile else {
                    log::warn!(
                        "{}, trying to continue",
                        Error::TileFetchMiss(index_x, index_y, level)
                    );
                    buf_x += tile_width - offset_x;
                    continue;
                };

                if pixels > 0 {
                    tile.lock();
                    let tile_data = tile.data_mut();

                    let rows = (height - buf_y).min(tile_height - offset_y);
                    let lskip_bytes_src = lskip as usize * bpx_size;
                    let lskip_bytes_dst = lskip as usize * px_size;
                    let tp = (offset_y * tile_width + offset_x) as usize * px_size
                        + lskip_bytes_dst;
                    let bp = buf_y as usize * buf_stride
                        + buf_x as usize * bpx_size
                        + lskip_bytes_src;

                    // clip rows against the abyss one by one; the write
                    // path deliberately does not pre-skip top-of-tile
                    // abyss rows (kept simple for sliced multi-threaded
                    // rendering)
                    for row in 0..rows {
                        let y = buffer_y + buf_y + row;
                        if y < buffer_abyss_y || y >= abyss_y_total {
                            continue;
                        }
                        let src_row = bp + row as usize * buf_stride;
                        let dst_row = tp + row as usize * tile_stride;
                        if same_format {
                            ops::copy_rows(
                                &mut tile_data[dst_row..],
                                tile_stride,
                                &src[src_row..],
                                buf_stride,
                                pixels as usize * px_size,
                                1,
                            );
                        } else {
                            convert_rows(
                                format,
                                soft_format,
                                &src[src_row..],
                                buf_stride,
                                &mut tile_data[dst_row..],
                                tile_stride,
                                pixels as usize,
                                1,
                            );
                        }
                    }

                    tile.unlock_no_void();
                }

                if !storage.cache().contains(index_x, index_y, level) {
                    storage.set_tile(index_x, index_y, level, tile);
                }
                buf_x += tile_width - offset_x;
            }
            buf_y += tile_height - offset_y;
        }

        if level == 0 {
            storage.damage_rect(&Rect::new(buffer_x, buffer_y, width, height));
        }
    }
}
