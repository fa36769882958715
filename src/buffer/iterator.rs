//! Multi-buffer iterator
//!
//! Drives aligned tile scans over up to several buffers with mixed
//! read/write access. The first sub-iterator's buffer fixes the tile grid;
//! the others either ride along directly (compatible grid, no conversion),
//! borrow their single tile up front (linear buffers), fall back to
//! read-through scratch regions (format conversion, unaligned rects, abyss
//! fills), or alias an earlier sub-iterator outright.
//!
//! Each [`BufferIterator::next`] exposes one contiguous region per
//! sub-iterator. When any region is not a full tile the iterator switches
//! to row granularity within the current tile. Writers are processed
//! before readers so a discard-fetch can never destroy bytes a reader is
//! about to see.

use std::sync::Arc;

use super::{AbyssPolicy, Buffer, SampleFilter};
use crate::error::Error;
use crate::format::PixelFormat;
use crate::rect::{tile_index, Rect};
use crate::tile::Tile;

/// Access mode of one sub-iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    fn or(self, other: Access) -> Access {
        match (self.reads() || other.reads(), self.writes() || other.writes()) {
            (true, true) => Access::ReadWrite,
            (false, true) => Access::Write,
            _ => Access::Read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileMode {
    Empty,
    DirectTile,
    LinearTile,
    GetBuffer,
    Alias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    InTile,
    InRows,
    Stop,
    Invalid,
}

/// One exposed region: a rectangle and a contiguous run of pixels
pub struct IterItem {
    pub roi: Rect,
    data: *mut u8,
    len: usize,
}

impl IterItem {
    /// The region's pixels; valid until the next `next()` call
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// Mutable view of the region's pixels.
    ///
    /// Aliasing discipline follows the access modes declared on `add`:
    /// only take mutable views of write-access items.
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }
}

struct SubIter {
    buffer: Arc<Buffer>,
    full_rect: Rect,
    access: Access,
    policy: AbyssPolicy,
    format: PixelFormat,
    format_bpp: usize,
    level: i32,
    /// Needs the read-through scratch path on every step
    incompatible: bool,
    alias_of: Option<usize>,
    mode: TileMode,
    row_stride: usize,
    real_roi: Rect,
    current_tile: Option<Arc<Tile>>,
    scratch: Option<Vec<u8>>,
    linear_tile: Option<Arc<Tile>>,
}

pub struct BufferIterator {
    subs: Vec<SubIter>,
    items: Vec<IterItem>,
    access_order: Vec<usize>,
    origin_tile: Rect,
    state: State,
    remaining_rows: i32,
    /// Pixels in each exposed region
    pub length: usize,
    no_notify: bool,
}

// Tile data pointers are only dereferenced by the owning thread.
unsafe impl Send for BufferIterator {}

impl BufferIterator {
    /// Starts an iterator over one buffer; more join via [`Self::add`]
    pub fn new(
        buffer: &Arc<Buffer>,
        roi: Option<&Rect>,
        level: i32,
        format: Option<PixelFormat>,
        access: Access,
        policy: AbyssPolicy,
        no_notify: bool,
    ) -> BufferIterator {
        let mut iter = BufferIterator {
            subs: Vec::new(),
            items: Vec::new(),
            access_order: Vec::new(),
            origin_tile: Rect::default(),
            state: State::Start,
            remaining_rows: 0,
            length: 0,
            no_notify,
        };
        iter.add(buffer, roi, level, format, access, policy);
        iter
    }

    /// Adds a sub-iterator; its rect is clamped to the primary's size.
    /// Returns the sub-iterator's index.
    pub fn add(
        &mut self,
        buffer: &Arc<Buffer>,
        roi: Option<&Rect>,
        level: i32,
        format: Option<PixelFormat>,
        access: Access,
        policy: AbyssPolicy,
    ) -> usize {
        let index = self.subs.len();
        let format = format.unwrap_or_else(|| buffer.format());
        let mut full_rect = match roi {
            Some(rect) => *rect,
            None => buffer.extent(),
        };

        if index == 0 && (full_rect.width <= 0 || full_rect.height <= 0) {
            self.state = State::Invalid;
        }
        if index > 0 {
            full_rect.width = self.subs[0].full_rect.width;
            full_rect.height = self.subs[0].full_rect.height;
        }

        self.subs.push(SubIter {
            buffer: Arc::clone(buffer),
            full_rect,
            access,
            policy,
            format,
            format_bpp: format.bytes_per_pixel(),
            level,
            incompatible: false,
            alias_of: None,
            mode: TileMode::Empty,
            row_stride: 0,
            real_roi: Rect::default(),
            current_tile: None,
            scratch: None,
            linear_tile: None,
        });
        self.items.push(IterItem {
            roi: Rect::default(),
            data: std::ptr::null_mut(),
            len: 0,
        });
        index
    }

    /// Advances to the next region; false when iteration has finished
    pub fn next(&mut self) -> bool {
        match self.state {
            State::Start => {
                #[cfg(feature = "linear-shortcut")]
                {
                    let sub0 = &self.subs[0];
                    let primary = &sub0.buffer;
                    let extent = primary.extent();
                    if primary.tile_width() == extent.width
                        && primary.tile_height() == extent.height
                        && sub0.full_rect.width == primary.tile_width()
                        && sub0.full_rect.height == primary.tile_height()
                        && sub0.full_rect.x == extent.x
                        && sub0.full_rect.y == extent.y
                        && primary.shift() == (0, 0)
                    {
                        self.prepare();
                        self.linear_shortcut();
                        return true;
                    }
                }

                self.prepare();
                self.initialize_rects();
                self.load_rects();
                true
            }
            State::InRows => {
                for index in 0..self.subs.len() {
                    let stride = self.effective_stride(index);
                    let item = &mut self.items[index];
                    item.data = unsafe { item.data.add(stride) };
                    item.roi.y += 1;
                }
                self.remaining_rows -= 1;
                if self.remaining_rows == 0 {
                    self.state = State::InTile;
                }
                true
            }
            State::InTile => {
                for i in (0..self.access_order.len()).rev() {
                    let index = self.access_order[i];
                    self.release_tile(index);
                }
                if !self.increment_rects() {
                    self.stop();
                    return false;
                }
                self.load_rects();
                true
            }
            State::Stop | State::Invalid => {
                self.stop();
                false
            }
        }
    }

    pub fn item(&self, index: usize) -> &IterItem {
        &self.items[index]
    }

    fn effective_stride(&self, index: usize) -> usize {
        match self.subs[index].alias_of {
            Some(lead) => self.subs[lead].row_stride,
            None => self.subs[index].row_stride,
        }
    }

    fn prepare(&mut self) {
        let (origin_offset_x, origin_offset_y);
        {
            let buffer = &self.subs[0].buffer;
            self.origin_tile = Rect::new(
                buffer.shift_x(),
                buffer.shift_y(),
                buffer.tile_width(),
                buffer.tile_height(),
            );
            origin_offset_x = buffer.shift_x() + self.subs[0].full_rect.x;
            origin_offset_y = buffer.shift_y() + self.subs[0].full_rect.y;
        }

        // writers first, readers last
        let n = self.subs.len();
        self.access_order = vec![0; n];
        {
            let mut i_write = 0;
            let mut i_read = n - 1;
            for (index, sub) in self.subs.iter().enumerate() {
                if sub.access.writes() {
                    self.access_order[i_write] = index;
                    i_write += 1;
                } else {
                    self.access_order[i_read] = index;
                    i_read = i_read.wrapping_sub(1);
                }
            }
        }

        // walk access-order positions, not add order: an alias lead must
        // sit earlier in the scan order than anything riding on it, or a
        // step would copy the lead's item before the lead is refreshed
        for i in 0..n {
            let index = self.access_order[i];

            // alias detection: same storage, level, format, offsets, and
            // abyss-contained rects collapse onto the earlier sub-iterator
            let mut alias = None;
            {
                let sub = &self.subs[index];
                for j in 0..i {
                    let lead = self.access_order[j];
                    let lead_sub = &self.subs[lead];
                    if lead_sub.alias_of.is_none()
                        && Arc::ptr_eq(lead_sub.buffer.storage(), sub.buffer.storage())
                        && lead_sub.level == sub.level
                        && lead_sub.format == sub.format
                        && lead_sub.buffer.shift_x() + lead_sub.full_rect.x
                            == sub.buffer.shift_x() + sub.full_rect.x
                        && lead_sub.buffer.shift_y() + lead_sub.full_rect.y
                            == sub.buffer.shift_y() + sub.full_rect.y
                        && lead_sub.buffer.abyss().contains(&lead_sub.full_rect)
                        && sub.buffer.abyss().contains(&sub.full_rect)
                    {
                        alias = Some(lead);
                        break;
                    }
                }
            }
            if let Some(lead) = alias {
                let access = self.subs[index].access;
                self.subs[lead].access = self.subs[lead].access.or(access);
                self.subs[index].alias_of = Some(lead);
                self.subs[index].buffer.lock();
                continue;
            }

            let sub = &mut self.subs[index];
            let buffer = Arc::clone(&sub.buffer);
            let current_offset_x = buffer.shift_x() + sub.full_rect.x;
            let current_offset_y = buffer.shift_y() + sub.full_rect.y;

            if buffer.format() != sub.format {
                sub.incompatible = true;
            } else if self.origin_tile.width != buffer.tile_width()
                || self.origin_tile.height != buffer.tile_height()
                || (origin_offset_x - current_offset_x).abs() % self.origin_tile.width != 0
                || (origin_offset_y - current_offset_y).abs() % self.origin_tile.height != 0
            {
                if buffer.is_linear() {
                    match buffer.storage().get_tile(0, 0, 0) {
                        Some(tile) => {
                            if sub.access.writes() {
                                tile.lock();
                            } else {
                                tile.read_lock();
                            }
                            sub.linear_tile = Some(tile);
                        }
                        None => {
                            log::warn!(
                                "{}, reading through scratch",
                                Error::TileFetchMiss(0, 0, 0)
                            );
                            sub.incompatible = true;
                        }
                    }
                } else {
                    sub.incompatible = true;
                }
            }

            buffer.lock();
        }
    }

    fn retile_subs(&mut self, x: i32, y: i32) {
        let shift_x = self.origin_tile.x;
        let shift_y = self.origin_tile.y;
        let tile_x = tile_index(x + shift_x, self.origin_tile.width);
        let tile_y = tile_index(y + shift_y, self.origin_tile.height);

        let grid_rect = Rect::new(
            tile_x * self.origin_tile.width - shift_x,
            tile_y * self.origin_tile.height - shift_y,
            self.origin_tile.width,
            self.origin_tile.height,
        );

        let primary_roi = grid_rect
            .intersect(&self.subs[0].full_rect)
            .expect("scan stays inside the primary rect");
        self.items[0].roi = primary_roi;
        self.subs[0].real_roi = primary_roi;

        for index in 1..self.subs.len() {
            let offset_x = self.subs[index].full_rect.x - self.subs[0].full_rect.x;
            let offset_y = self.subs[index].full_rect.y - self.subs[0].full_rect.y;
            let roi = Rect::new(
                primary_roi.x + offset_x,
                primary_roi.y + offset_y,
                primary_roi.width,
                primary_roi.height,
            );
            self.items[index].roi = roi;
            self.subs[index].real_roi = roi;
        }
    }

    fn initialize_rects(&mut self) {
        let x = self.subs[0].full_rect.x;
        let y = self.subs[0].full_rect.y;
        self.retile_subs(x, y);
    }

    fn increment_rects(&mut self) -> bool {
        let full = self.subs[0].full_rect;
        let mut x = self.items[0].roi.x + self.items[0].roi.width;
        let mut y = self.items[0].roi.y;

        if x >= full.x + full.width {
            x = full.x;
            y += self.items[0].roi.height;
            if y >= full.y + full.height {
                return false;
            }
        }
        self.retile_subs(x, y);
        true
    }

    fn get_tile(&mut self, index: usize) {
        let sub = &mut self.subs[index];
        let item = &mut self.items[index];
        let buffer = &sub.buffer;

        if sub.linear_tile.is_some() {
            let linear = Arc::clone(sub.linear_tile.as_ref().unwrap());
            let extent = buffer.extent();
            let stride = buffer.tile_width() as usize * sub.format_bpp;
            item.data = if sub.access.writes() {
                linear.data_mut().as_mut_ptr()
            } else {
                linear.data().as_ptr() as *mut u8
            };
            item.len = linear.size();
            sub.current_tile = Some(linear);
            sub.real_roi = extent;
            sub.mode = TileMode::LinearTile;
            sub.row_stride = stride;
            return;
        }

        let shift_x = buffer.shift_x();
        let shift_y = buffer.shift_y();
        let tile_width = buffer.tile_width();
        let tile_height = buffer.tile_height();
        let tile_x = tile_index(item.roi.x + shift_x, tile_width);
        let tile_y = tile_index(item.roi.y + shift_y, tile_height);

        let tile_rect = Rect::new(
            tile_x * tile_width - shift_x,
            tile_y * tile_height - shift_y,
            tile_width,
            tile_height,
        );
        let discard = sub.access == Access::Write && sub.full_rect.contains(&tile_rect);
        let level = sub.level;

        let tile = if discard {
            buffer.storage().get_tile_discard(tile_x, tile_y, level)
        } else {
            buffer.storage().get_tile(tile_x, tile_y, level)
        };
        let Some(tile) = tile else {
            // a missed tile degrades this step to the scratch path, which
            // warns per tile and leaves missed regions zeroed
            log::warn!(
                "{}, reading through scratch",
                Error::TileFetchMiss(tile_x, tile_y, level)
            );
            self.get_indirect(index);
            return;
        };

        if sub.access.writes() {
            tile.lock();
        } else {
            tile.read_lock();
        }

        sub.real_roi = tile_rect;
        sub.row_stride = tile_width as usize * sub.format_bpp;
        item.data = if sub.access.writes() {
            tile.data_mut().as_mut_ptr()
        } else {
            tile.data().as_ptr() as *mut u8
        };
        item.len = tile.size();
        sub.current_tile = Some(tile);
        sub.mode = TileMode::DirectTile;
    }

    fn get_indirect(&mut self, index: usize) {
        let sub = &mut self.subs[index];
        let item = &mut self.items[index];

        let size = sub.format_bpp * sub.real_roi.width as usize * sub.real_roi.height as usize;
        let mut data = vec![0u8; size];

        if sub.access.reads() {
            let scale = if sub.level != 0 {
                1.0 / (1i64 << sub.level) as f64
            } else {
                1.0
            };
            sub.buffer.get_unlocked(
                scale,
                &sub.real_roi,
                Some(sub.format),
                &mut data,
                sub.real_roi.width as usize * sub.format_bpp,
                sub.policy,
                SampleFilter::Auto,
            );
        }

        sub.row_stride = sub.real_roi.width as usize * sub.format_bpp;
        item.data = data.as_mut_ptr();
        item.len = size;
        sub.scratch = Some(data);
        sub.mode = TileMode::GetBuffer;
    }

    fn needs_indirect_read(&self, index: usize) -> bool {
        let sub = &self.subs[index];
        if sub.incompatible {
            return true;
        }
        !sub.buffer.abyss().contains(&self.items[index].roi)
    }

    fn needs_rows(&self, index: usize) -> bool {
        let sub = &self.subs[index];
        if sub.mode == TileMode::GetBuffer {
            return false;
        }
        self.items[index].roi.width != sub.buffer.tile_width()
            || self.items[index].roi.height != sub.buffer.tile_height()
    }

    fn load_rects(&mut self) {
        let mut next_state = State::InTile;

        for i in 0..self.access_order.len() {
            let index = self.access_order[i];
            if let Some(lead) = self.subs[index].alias_of {
                self.subs[index].mode = TileMode::Alias;
                self.items[index].roi = self.items[lead].roi;
                self.items[index].data = self.items[lead].data;
                self.items[index].len = self.items[lead].len;
                continue;
            }
            if self.needs_indirect_read(index) {
                self.get_indirect(index);
            } else {
                self.get_tile(index);
            }
            if next_state != State::InRows && self.needs_rows(index) {
                next_state = State::InRows;
            }
        }

        if next_state == State::InRows {
            if self.items[0].roi.height == 1 {
                next_state = State::InTile;
            }
            self.remaining_rows = self.items[0].roi.height - 1;

            for index in 0..self.subs.len() {
                if self.subs[index].alias_of.is_some() {
                    continue;
                }
                let stride = self.subs[index].row_stride;
                let bpp = self.subs[index].format_bpp;
                let offset_x = self.items[index].roi.x - self.subs[index].real_roi.x;
                let offset_y = self.items[index].roi.y - self.subs[index].real_roi.y;
                let item = &mut self.items[index];
                item.data = unsafe {
                    item.data
                        .add(offset_y as usize * stride + offset_x as usize * bpp)
                };
                item.roi.height = 1;
                item.len = item.roi.width as usize * bpp;
            }
            // aliases track their lead after the adjustment
            for index in 0..self.subs.len() {
                if let Some(lead) = self.subs[index].alias_of {
                    self.items[index].data = self.items[lead].data;
                    self.items[index].roi = self.items[lead].roi;
                    self.items[index].len = self.items[lead].len;
                }
            }
        }

        self.length = (self.items[0].roi.width * self.items[0].roi.height) as usize;
        self.state = next_state;
    }

    fn release_tile(&mut self, index: usize) {
        let mode = self.subs[index].mode;
        match mode {
            TileMode::DirectTile => {
                let sub = &mut self.subs[index];
                let tile = sub.current_tile.take().expect("direct mode holds a tile");
                if sub.access.writes() {
                    tile.unlock_no_void();
                } else {
                    tile.read_unlock();
                }
                sub.mode = TileMode::Empty;
            }
            TileMode::LinearTile => {
                self.subs[index].current_tile = None;
                self.subs[index].mode = TileMode::Empty;
            }
            TileMode::GetBuffer => {
                let sub = &mut self.subs[index];
                let scratch = sub.scratch.take().expect("indirect mode holds scratch");
                if sub.access.writes() {
                    sub.buffer.set_unlocked_no_notify(
                        &sub.real_roi,
                        sub.level,
                        sub.format,
                        &scratch,
                        sub.real_roi.width as usize * sub.format_bpp,
                    );
                }
                sub.mode = TileMode::Empty;
            }
            TileMode::Alias | TileMode::Empty => {
                self.subs[index].mode = TileMode::Empty;
            }
        }
        // a released item must never pair a dangling pointer with a
        // plausible length
        self.items[index].data = std::ptr::null_mut();
        self.items[index].len = 0;
    }

    #[cfg(feature = "linear-shortcut")]
    fn linear_shortcut(&mut self) {
        let full0 = self.subs[0].full_rect;
        for i in 0..self.access_order.len() {
            let index = self.access_order[i];
            let offset_x = self.subs[index].full_rect.x - full0.x;
            let offset_y = self.subs[index].full_rect.y - full0.y;
            let roi = Rect::new(full0.x + offset_x, full0.y + offset_y, full0.width, full0.height);
            self.subs[index].real_roi = roi;
            self.items[index].roi = roi;

            if i == 0 {
                self.get_tile(index);
            } else if Arc::ptr_eq(&self.subs[index].buffer, &self.subs[self.access_order[0]].buffer)
                && self.subs[index].format == self.subs[self.access_order[0]].format
            {
                let lead = self.access_order[0];
                self.items[index].data = self.items[lead].data;
                self.items[index].len = self.items[lead].len;
            } else {
                self.get_indirect(index);
            }
        }
        self.length = (full0.width * full0.height) as usize;
        self.state = State::Stop;
    }

    fn stop(&mut self) {
        if self.state == State::Invalid {
            return;
        }
        self.state = State::Invalid;

        for i in (0..self.access_order.len()).rev() {
            let index = self.access_order[i];

            if self.subs[index].alias_of.is_none() {
                if self.subs[index].mode != TileMode::Empty {
                    self.release_tile(index);
                }

                if let Some(linear) = self.subs[index].linear_tile.take() {
                    if self.subs[index].access.writes() {
                        linear.unlock_no_void();
                    } else {
                        linear.read_unlock();
                    }
                }

                let sub = &self.subs[index];
                if sub.level == 0 && sub.access.writes() && !sub.incompatible {
                    let damage = Rect::new(
                        sub.full_rect.x + sub.buffer.shift_x(),
                        sub.full_rect.y + sub.buffer.shift_y(),
                        sub.full_rect.width,
                        sub.full_rect.height,
                    );
                    sub.buffer.storage().damage_rect(&damage);
                }
                if sub.access.writes() {
                    sub.buffer.mark_initialized();
                }
            }

            let sub = &self.subs[index];
            sub.buffer.unlock();
            if sub.access.writes() && !self.no_notify {
                sub.buffer.emit_changed(&sub.full_rect);
            }
        }
        self.access_order.clear();
    }
}

impl Drop for BufferIterator {
    fn drop(&mut self) {
        // access_order is only populated between prepare() and stop()
        if !self.access_order.is_empty() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(width: i32, height: i32, tile: i32, value: u8) -> Arc<Buffer> {
        let buffer = Buffer::with_tile_size(
            Rect::new(0, 0, width, height),
            PixelFormat::RGBA_U8,
            tile,
            tile,
        );
        buffer.set_color_from_pixel(None, &[value, value, value, 255], PixelFormat::RGBA_U8);
        buffer
    }

    fn read_px(buffer: &Buffer, x: i32, y: i32) -> [u8; 4] {
        let mut px = [0u8; 4];
        buffer.get(
            &Rect::new(x, y, 1, 1),
            1.0,
            None,
            &mut px,
            4,
            AbyssPolicy::None,
            SampleFilter::Auto,
        );
        px
    }

    #[test]
    fn test_single_buffer_write_covers_all() {
        let buffer = filled(64, 64, 32, 0);
        let mut iter = BufferIterator::new(
            &buffer,
            Some(&Rect::new(0, 0, 64, 64)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            false,
        );
        let mut pixels = 0usize;
        while iter.next() {
            let item = iter.item(0);
            item.data_mut().fill(200);
            pixels += iter.length;
        }
        assert_eq!(pixels, 64 * 64);
        assert_eq!(read_px(&buffer, 0, 0), [200, 200, 200, 200]);
        assert_eq!(read_px(&buffer, 63, 63), [200, 200, 200, 200]);
    }

    #[test]
    fn test_unaligned_roi_row_mode() {
        let buffer = filled(64, 64, 32, 10);
        let roi = Rect::new(5, 7, 40, 20);
        let mut iter = BufferIterator::new(
            &buffer,
            Some(&roi),
            0,
            None,
            Access::ReadWrite,
            AbyssPolicy::None,
            false,
        );
        let mut pixels = 0usize;
        while iter.next() {
            let item = iter.item(0);
            let data = item.data_mut();
            for px in data.chunks_mut(4) {
                assert_eq!(px, &[10, 10, 10, 255]);
                px[0] = 99;
            }
            pixels += iter.length;
        }
        assert_eq!(pixels, (roi.width * roi.height) as usize);
        assert_eq!(read_px(&buffer, 5, 7), [99, 10, 10, 255]);
        assert_eq!(read_px(&buffer, 44, 26), [99, 10, 10, 255]);
        // outside the roi untouched
        assert_eq!(read_px(&buffer, 4, 7), [10, 10, 10, 255]);
        assert_eq!(read_px(&buffer, 45, 7), [10, 10, 10, 255]);
    }

    #[test]
    fn test_two_buffers_copy() {
        let src = filled(64, 64, 32, 42);
        let dst = filled(64, 64, 32, 0);

        let mut iter = BufferIterator::new(
            &dst,
            Some(&Rect::new(0, 0, 64, 64)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            false,
        );
        let s = iter.add(&src, Some(&Rect::new(0, 0, 64, 64)), 0, None, Access::Read, AbyssPolicy::None);
        while iter.next() {
            let out = iter.item(0);
            let inp = iter.item(s);
            out.data_mut()[..inp.data().len()].copy_from_slice(inp.data());
        }
        assert_eq!(read_px(&dst, 33, 33), [42, 42, 42, 255]);
    }

    #[test]
    fn test_format_conversion_sub() {
        let src = filled(32, 32, 32, 128);
        let dst = filled(32, 32, 32, 0);

        let mut iter = BufferIterator::new(
            &dst,
            Some(&Rect::new(0, 0, 32, 32)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            false,
        );
        let s = iter.add(
            &src,
            Some(&Rect::new(0, 0, 32, 32)),
            0,
            Some(PixelFormat::RGBA_F32),
            Access::Read,
            AbyssPolicy::None,
        );
        while iter.next() {
            let out = iter.item(0).data_mut();
            let inp = iter.item(s).data();
            for (o, i) in out.chunks_mut(4).zip(inp.chunks(16)) {
                let r = f32::from_ne_bytes([i[0], i[1], i[2], i[3]]);
                o[0] = (r * 255.0 + 0.5) as u8;
                o[1] = o[0];
                o[2] = o[0];
                o[3] = 255;
            }
        }
        assert_eq!(read_px(&dst, 10, 10), [128, 128, 128, 255]);
    }

    #[test]
    fn test_offset_subrects() {
        // read from a shifted region of the source
        let src = Buffer::with_tile_size(Rect::new(0, 0, 64, 64), PixelFormat::RGBA_U8, 32, 32);
        let mut data = vec![0u8; 64 * 64 * 4];
        for y in 0..64usize {
            for x in 0..64usize {
                data[(y * 64 + x) * 4] = x as u8;
                data[(y * 64 + x) * 4 + 3] = 255;
            }
        }
        src.set(&Rect::new(0, 0, 64, 64), 0, PixelFormat::RGBA_U8, &data, 64 * 4);

        let dst = filled(32, 32, 32, 0);
        let mut iter = BufferIterator::new(
            &dst,
            Some(&Rect::new(0, 0, 32, 32)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            false,
        );
        let s = iter.add(
            &src,
            Some(&Rect::new(16, 0, 32, 32)),
            0,
            None,
            Access::Read,
            AbyssPolicy::None,
        );
        while iter.next() {
            let out = iter.item(0);
            let inp = iter.item(s);
            out.data_mut()[..inp.data().len()].copy_from_slice(inp.data());
        }
        // dst x=0 came from src x=16
        assert_eq!(read_px(&dst, 0, 5)[0], 16);
        assert_eq!(read_px(&dst, 31, 5)[0], 47);
    }

    #[test]
    fn test_alias_detection_shares_data() {
        let buffer = filled(64, 64, 32, 77);
        let rect = Rect::new(0, 0, 64, 64);
        let mut iter = BufferIterator::new(
            &buffer,
            Some(&rect),
            0,
            None,
            Access::ReadWrite,
            AbyssPolicy::None,
            false,
        );
        let second = iter.add(&buffer, Some(&rect), 0, None, Access::Read, AbyssPolicy::None);
        let mut steps = 0;
        while iter.next() {
            assert_eq!(
                iter.item(0).data.cast_const(),
                iter.item(second).data.cast_const(),
                "alias must expose the lead's pointer"
            );
            steps += 1;
        }
        assert!(steps > 0);
    }

    #[test]
    fn test_alias_reader_added_before_writer() {
        // the writer sorts ahead of the reader in scan order, so the
        // reader must alias the writer even though it was added first;
        // every step has to expose live, matching regions for both
        let buffer = filled(64, 64, 32, 5);
        let rect = Rect::new(0, 0, 64, 64);
        let mut iter = BufferIterator::new(
            &buffer,
            Some(&rect),
            0,
            None,
            Access::Read,
            AbyssPolicy::None,
            false,
        );
        let writer = iter.add(&buffer, Some(&rect), 0, None, Access::Write, AbyssPolicy::None);
        let mut steps = 0;
        while iter.next() {
            assert!(!iter.item(0).data.is_null());
            assert!(iter.item(0).len > 0);
            assert_eq!(
                iter.item(0).data.cast_const(),
                iter.item(writer).data.cast_const()
            );
            assert_eq!(iter.item(0).data()[0], 5);
            iter.item(writer).data_mut().fill(9);
            assert_eq!(iter.item(0).data()[0], 9);
            steps += 1;
        }
        assert_eq!(steps, 4);
        assert_eq!(read_px(&buffer, 50, 50), [9, 9, 9, 9]);
    }

    #[test]
    fn test_linear_secondary_buffer() {
        // secondary is a one-tile buffer with an incompatible grid offset
        let big = filled(64, 64, 32, 0);
        let small = Buffer::with_tile_size(Rect::new(0, 0, 16, 16), PixelFormat::RGBA_U8, 16, 16);
        small.set_color_from_pixel(None, &[5, 6, 7, 255], PixelFormat::RGBA_U8);
        assert!(small.is_linear());

        let mut iter = BufferIterator::new(
            &big,
            Some(&Rect::new(0, 0, 16, 16)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            false,
        );
        let s = iter.add(
            &small,
            Some(&Rect::new(0, 0, 16, 16)),
            0,
            None,
            Access::Read,
            AbyssPolicy::None,
        );
        while iter.next() {
            let out = iter.item(0);
            let inp = iter.item(s);
            out.data_mut()[..inp.data().len()].copy_from_slice(inp.data());
        }
        assert_eq!(read_px(&big, 3, 3), [5, 6, 7, 255]);
    }

    #[test]
    fn test_writers_notify_on_stop() {
        let buffer = filled(32, 32, 32, 0);
        let fired = Arc::new(std::sync::Mutex::new(0));
        let fired2 = Arc::clone(&fired);
        buffer.connect_changed(move |_| *fired2.lock().unwrap() += 1);

        let mut iter = BufferIterator::new(
            &buffer,
            Some(&Rect::new(0, 0, 32, 32)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            false,
        );
        while iter.next() {
            iter.item(0).data_mut().fill(1);
        }
        assert_eq!(*fired.lock().unwrap(), 1);

        let mut quiet = BufferIterator::new(
            &buffer,
            Some(&Rect::new(0, 0, 32, 32)),
            0,
            None,
            Access::Write,
            AbyssPolicy::None,
            true,
        );
        while quiet.next() {
            quiet.item(0).data_mut().fill(2);
        }
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn test_abyss_fallback_region() {
        // roi pokes outside the abyss: reads fill, writes are clipped
        let buffer = filled(32, 32, 32, 50);
        buffer.set_abyss(Rect::new(0, 0, 16, 16));

        let mut iter = BufferIterator::new(
            &buffer,
            Some(&Rect::new(8, 8, 16, 16)),
            0,
            None,
            Access::Read,
            AbyssPolicy::None,
            false,
        );
        let mut saw_zero = false;
        let mut saw_fifty = false;
        while iter.next() {
            for px in iter.item(0).data().chunks(4) {
                if px[0] == 0 {
                    saw_zero = true;
                }
                if px[0] == 50 {
                    saw_fifty = true;
                }
            }
        }
        assert!(saw_zero && saw_fifty);
    }

    #[test]
    fn test_empty_roi_invalid() {
        let buffer = filled(16, 16, 32, 0);
        let mut iter = BufferIterator::new(
            &buffer,
            Some(&Rect::new(0, 0, 0, 16)),
            0,
            None,
            Access::Read,
            AbyssPolicy::None,
            false,
        );
        assert!(!iter.next());
    }
}
