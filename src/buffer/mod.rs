//! Buffers: views over tile storage
//!
//! A [`Buffer`] presents an apparently unbounded 2-D raster. It is a thin
//! view — extent, abyss, coordinate shift, and an advertised pixel format —
//! over a shared [`TileStorage`]. Several buffers may look at one storage
//! through different origins; [`Buffer::dup`] clones a buffer in O(tiles)
//! by COW-sharing tile bytes.

pub mod file;
pub mod iterator;
pub mod read;
pub mod write;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::format::{convert_pixels, PixelFormat};
use crate::ops;
use crate::rect::{tile_index, Rect};
use crate::tile::backend::{RamBackend, TileBackend};
use crate::tile::empty;
use crate::tile::storage::TileStorage;

/// Default tile geometry for buffers created without an explicit backend
pub const DEFAULT_TILE_WIDTH: i32 = 128;
pub const DEFAULT_TILE_HEIGHT: i32 = 64;

/// What reads outside the abyss produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbyssPolicy {
    /// Transparent black (all-zero bytes in storage format)
    #[default]
    None = 0,
    /// Clamp coordinates to the nearest abyss pixel
    Clamp = 1,
    /// Wrap coordinates within the abyss
    Loop = 2,
    /// Opaque black
    Black = 3,
    /// Opaque white
    White = 4,
}

/// Resampling filter for scaled reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFilter {
    /// Nearest at or beyond 2×, box between 1× and 2×, bilinear below
    #[default]
    Auto,
    Nearest,
    Bilinear,
    Box,
}

/// Flags controlling a rectangle write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetFlags {
    pub lock: bool,
    pub notify: bool,
}

impl SetFlags {
    pub const FAST: SetFlags = SetFlags { lock: false, notify: false };
    pub const NOTIFY: SetFlags = SetFlags { lock: false, notify: true };
    pub const FULL: SetFlags = SetFlags { lock: true, notify: true };
}

struct BufferState {
    extent: Rect,
    abyss: Rect,
    abyss_tracks_extent: bool,
    soft_format: PixelFormat,
}

type ChangedCallback = Box<dyn Fn(&Rect) + Send + Sync>;

/// A view (extent + abyss + shift + format) over a tile storage
pub struct Buffer {
    storage: Arc<TileStorage>,
    state: RwLock<BufferState>,
    shift_x: i32,
    shift_y: i32,
    /// Depth of the user-visible lock; while held, change notifications
    /// accumulate into one damage window.
    lock_count: AtomicU32,
    pending_changed: Mutex<Option<Rect>>,
    callbacks: Mutex<Vec<(u64, ChangedCallback)>>,
    next_callback_id: AtomicU64,
    /// Bumped on every change; samplers compare it to invalidate strips
    generation: AtomicU64,
    /// Multi-process shared buffers flush after every write
    shared: AtomicBool,
    initialized: AtomicBool,
}

impl Buffer {
    /// Creates a buffer over a fresh in-memory storage
    pub fn new(extent: Rect, format: PixelFormat) -> Arc<Buffer> {
        Buffer::with_tile_size(extent, format, DEFAULT_TILE_WIDTH, DEFAULT_TILE_HEIGHT)
    }

    /// Creates a buffer with explicit tile geometry
    pub fn with_tile_size(
        extent: Rect,
        format: PixelFormat,
        tile_width: i32,
        tile_height: i32,
    ) -> Arc<Buffer> {
        let backend = Arc::new(RamBackend::new(tile_width, tile_height, format));
        Buffer::for_backend_full(extent, backend, false)
    }

    /// Creates a buffer over an existing backend
    pub fn for_backend(extent: Rect, backend: Arc<dyn TileBackend>) -> Arc<Buffer> {
        Buffer::for_backend_full(extent, backend, true)
    }

    fn for_backend_full(
        extent: Rect,
        backend: Arc<dyn TileBackend>,
        initialized: bool,
    ) -> Arc<Buffer> {
        let format = backend.format();
        let storage = TileStorage::new(backend, initialized);
        Arc::new(Buffer {
            storage,
            state: RwLock::new(BufferState {
                extent,
                abyss: extent,
                abyss_tracks_extent: true,
                soft_format: format,
            }),
            shift_x: 0,
            shift_y: 0,
            lock_count: AtomicU32::new(0),
            pending_changed: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            shared: AtomicBool::new(false),
            initialized: AtomicBool::new(initialized),
        })
    }

    /// A new view over the same storage, restricted to `sub_extent`
    pub fn create_sub_buffer(self: &Arc<Buffer>, sub_extent: Rect) -> Arc<Buffer> {
        let state = self.state.read().unwrap();
        let abyss = state
            .abyss
            .intersect(&sub_extent)
            .unwrap_or(Rect::new(sub_extent.x, sub_extent.y, 0, 0));
        Arc::new(Buffer {
            storage: Arc::clone(&self.storage),
            state: RwLock::new(BufferState {
                extent: sub_extent,
                abyss,
                abyss_tracks_extent: false,
                soft_format: state.soft_format,
            }),
            shift_x: self.shift_x,
            shift_y: self.shift_y,
            lock_count: AtomicU32::new(0),
            pending_changed: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            shared: AtomicBool::new(false),
            initialized: AtomicBool::new(self.initialized.load(Ordering::Relaxed)),
        })
    }

    /// Duplicates the buffer into a new storage using tile-level COW
    pub fn dup(self: &Arc<Buffer>) -> Arc<Buffer> {
        let (extent, abyss, format) = {
            let state = self.state.read().unwrap();
            (state.extent, state.abyss, state.soft_format)
        };
        let new = Buffer::with_tile_size(
            extent,
            format,
            self.storage.tile_width,
            self.storage.tile_height,
        );
        {
            let mut state = new.state.write().unwrap();
            state.abyss = abyss;
            state.abyss_tracks_extent = false;
        }
        Buffer::copy(self, &extent, AbyssPolicy::None, &new, &extent);
        new.initialized.store(true, Ordering::Relaxed);
        new
    }

    pub fn extent(&self) -> Rect {
        self.state.read().unwrap().extent
    }

    pub fn abyss(&self) -> Rect {
        self.state.read().unwrap().abyss
    }

    pub fn set_extent(&self, extent: Rect) -> bool {
        let mut state = self.state.write().unwrap();
        state.extent = extent;
        if state.abyss_tracks_extent {
            state.abyss = extent;
        }
        self.storage.backend().set_extent(extent);
        true
    }

    pub fn set_abyss(&self, abyss: Rect) -> bool {
        let mut state = self.state.write().unwrap();
        state.abyss = abyss;
        state.abyss_tracks_extent = false;
        true
    }

    pub fn format(&self) -> PixelFormat {
        self.state.read().unwrap().soft_format
    }

    /// The storage's authoritative pixel format
    pub fn storage_format(&self) -> PixelFormat {
        self.storage.format
    }

    /// Overrides the advertised format; must keep bytes-per-pixel. `None`
    /// restores the storage format.
    pub fn set_format(&self, format: Option<PixelFormat>) -> Result<PixelFormat> {
        let mut state = self.state.write().unwrap();
        match format {
            None => {
                state.soft_format = self.storage.format;
                Ok(state.soft_format)
            }
            Some(format) => {
                if format.bytes_per_pixel() != self.storage.format.bytes_per_pixel() {
                    return Err(Error::FormatMismatch(format!(
                        "{} bpp != {} bpp",
                        format.bytes_per_pixel(),
                        self.storage.format.bytes_per_pixel()
                    )));
                }
                state.soft_format = format;
                Ok(format)
            }
        }
    }

    pub fn tile_width(&self) -> i32 {
        self.storage.tile_width
    }

    pub fn tile_height(&self) -> i32 {
        self.storage.tile_height
    }

    pub fn shift(&self) -> (i32, i32) {
        (self.shift_x, self.shift_y)
    }

    pub(crate) fn storage(&self) -> &Arc<TileStorage> {
        &self.storage
    }

    pub(crate) fn shift_x(&self) -> i32 {
        self.shift_x
    }

    pub(crate) fn shift_y(&self) -> i32 {
        self.shift_y
    }

    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Relaxed);
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    /// Whether the buffer is linear: a single tile covering the extent at
    /// shift `-origin`, so its bytes form one contiguous block.
    pub fn is_linear(&self) -> bool {
        let state = self.state.read().unwrap();
        state.extent.x == -self.shift_x
            && state.extent.y == -self.shift_y
            && state.extent.width == self.storage.tile_width
            && state.extent.height == self.storage.tile_height
    }

    /// Takes the user-visible lock; notifications batch until unlock
    pub fn lock(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        if self.lock_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let pending = self.pending_changed.lock().unwrap().take();
            if let Some(rect) = pending {
                self.fire_changed(&rect);
            }
        }
    }

    /// Registers a change callback; returns a handle for disconnecting
    pub fn connect_changed<F>(&self, callback: F) -> u64
    where
        F: Fn(&Rect) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().unwrap().push((id, Box::new(callback)));
        id
    }

    pub fn disconnect_changed(&self, id: u64) {
        self.callbacks.lock().unwrap().retain(|(i, _)| *i != id);
    }

    /// Current change generation; bumped on every emitted change
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn emit_changed(&self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        if self.lock_count.load(Ordering::Acquire) > 0 {
            let mut pending = self.pending_changed.lock().unwrap();
            *pending = Some(match *pending {
                Some(prior) => prior.bounding_box(rect),
                None => *rect,
            });
            return;
        }
        self.fire_changed(rect);
    }

    fn fire_changed(&self, rect: &Rect) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let callbacks = self.callbacks.lock().unwrap();
        for (_, callback) in callbacks.iter() {
            callback(rect);
        }
    }

    /// Drops the hot tile, pushes the extent to the backend and flushes
    /// the handler chain.
    pub fn flush(&self) {
        let _guard = self.storage.lock();
        self.storage.drop_hot_tile();
        self.storage.backend().set_extent(self.extent());
        self.storage.flush();
    }

    /// [`Buffer::flush`] restricted to `rect`, for external accelerators
    pub fn flush_ext(&self, _rect: Option<&Rect>) {
        self.flush();
    }

    /// Whether aligned scans over two buffers may run in parallel: equal
    /// tile shapes, and origins that differ by whole tiles.
    pub fn scan_compatible(a: &Buffer, ax: i32, ay: i32, b: &Buffer, bx: i32, by: i32) -> bool {
        if a.storage.tile_width != b.storage.tile_width {
            return false;
        }
        if a.storage.tile_height != b.storage.tile_height {
            return false;
        }
        if ((a.shift_x + ax) - (b.shift_x + bx)).abs() % a.storage.tile_width != 0 {
            return false;
        }
        if ((a.shift_y + ay) - (b.shift_y + by)).abs() % a.storage.tile_height != 0 {
            return false;
        }
        true
    }

    /// Fills `rect` with a single pixel given in `pixel_format`.
    ///
    /// Whole covered tiles are produced once and COW-cloned across the
    /// aligned interior (zero pixels borrow the shared zero tile); border
    /// strips go through the ordinary write path.
    pub fn set_color_from_pixel(
        self: &Arc<Buffer>,
        rect: Option<&Rect>,
        pixel: &[u8],
        pixel_format: PixelFormat,
    ) {
        let soft_format = self.format();
        let bpp = soft_format.bytes_per_pixel();

        let mut converted = vec![0u8; bpp];
        if pixel_format == soft_format {
            converted.copy_from_slice(&pixel[..bpp]);
        } else {
            convert_pixels(pixel_format, soft_format, pixel, &mut converted, 1);
        }

        let template: Mutex<Option<Arc<crate::tile::Tile>>> = Mutex::new(None);
        self.foreach_tile(
            rect,
            |buffer, tile_x, tile_y| {
                let mut template = template.lock().unwrap();
                let tile = match &*template {
                    Some(tile) => tile.dup(),
                    None => {
                        let tile = if ops::memeq_zero(&converted) {
                            empty::new_tile(buffer.storage.tile_size)
                        } else {
                            let tile = crate::tile::Tile::new(buffer.storage.tile_size);
                            tile.lock();
                            ops::memset_pattern(
                                tile.data_mut(),
                                &converted,
                                buffer.storage.tile_size / bpp,
                            );
                            tile.unlock_no_void();
                            tile
                        };
                        *template = Some(Arc::clone(&tile));
                        tile
                    }
                };
                buffer.storage.set_tile(tile_x, tile_y, 0, tile);
            },
            |buffer, border_rect| {
                let mut iter = iterator::BufferIterator::new(
                    buffer,
                    Some(border_rect),
                    0,
                    Some(soft_format),
                    iterator::Access::Write,
                    AbyssPolicy::None,
                    true,
                );
                while iter.next() {
                    let item = iter.item(0);
                    let n = (item.roi.width * item.roi.height) as usize;
                    ops::memset_pattern(item.data_mut(), &converted, n);
                }
            },
        );
        self.mark_initialized();
    }

    /// Sets `rect` to zero with the tile-COW-clone optimization
    pub fn clear(self: &Arc<Buffer>, rect: Option<&Rect>) {
        self.foreach_tile(
            rect,
            |buffer, tile_x, tile_y| {
                if buffer.is_initialized() {
                    buffer.storage.void(tile_x, tile_y, 0);
                } else {
                    let tile = empty::new_tile(buffer.storage.tile_size);
                    buffer.storage.set_tile(tile_x, tile_y, 0, tile);
                }
            },
            |buffer, border_rect| {
                let mut iter = iterator::BufferIterator::new(
                    buffer,
                    Some(border_rect),
                    0,
                    None,
                    iterator::Access::Write,
                    AbyssPolicy::None,
                    true,
                );
                while iter.next() {
                    let item = iter.item(0);
                    item.data_mut().fill(0);
                }
            },
        );
    }

    /// Tile-repeats `pattern` over `rect`, anchored at the offsets
    pub fn set_pattern(
        self: &Arc<Buffer>,
        rect: Option<&Rect>,
        pattern: &Arc<Buffer>,
        x_offset: i32,
        y_offset: i32,
    ) {
        let roi = match rect {
            Some(r) => *r,
            None => self.extent(),
        };
        let pattern_extent = pattern.extent();
        let format = self.format();
        let bpp = format.bytes_per_pixel();

        let data_extent = Rect::new(
            roi.x - x_offset,
            roi.y - y_offset,
            pattern_extent.width.min(roi.width),
            pattern_extent.height.min(roi.height),
        );
        if data_extent.width < 1 || data_extent.height < 1 {
            return;
        }

        // widen to at least two tiles so each set call carries real work
        let mut extended = data_extent;
        extended.width *= (self.tile_width() * 2 + extended.width - 1) / extended.width;
        extended.width = extended.width.min(roi.width);
        extended.height *= (self.tile_height() * 2 + extended.height - 1) / extended.height;
        extended.height = extended.height.min(roi.height);

        let rowstride = extended.width as usize * bpp;
        let mut data = vec![0u8; rowstride * extended.height as usize];

        pattern.get(
            &data_extent,
            1.0,
            Some(format),
            &mut data,
            rowstride,
            AbyssPolicy::Loop,
            SampleFilter::Auto,
        );

        // replicate the fetched block across the extended strip
        for y in 0..data_extent.height as usize {
            let mut x = pattern_extent.width;
            while x < extended.width {
                let size = (extended.width - x).min(x) as usize * bpp;
                let row = y * rowstride;
                let src_start = row;
                let dst_start = row + x as usize * bpp;
                data.copy_within(src_start..src_start + size, dst_start);
                x *= 2;
            }
        }
        let mut y = pattern_extent.height;
        while y < extended.height {
            let size = rowstride * (extended.height - y).min(y) as usize;
            data.copy_within(0..size, y as usize * rowstride);
            y *= 2;
        }

        let mut ty = roi.y;
        while ty < roi.y + roi.height {
            let mut tx = roi.x;
            while tx < roi.x + roi.width {
                let dest = Rect::new(tx, ty, extended.width, extended.height);
                if let Some(dest) = dest.intersect(&roi) {
                    self.set(&dest, 0, format, &data, rowstride);
                }
                tx += extended.width;
            }
            ty += extended.height;
        }
    }

    /// Copies `src_rect` from `src` into `dst_rect.origin` of `dst`.
    ///
    /// When the buffers are scan-compatible and share format and tile
    /// shape, whole tiles transfer as COW clones; only the unaligned
    /// border strips move pixel bytes.
    pub fn copy(
        src: &Arc<Buffer>,
        src_rect: &Rect,
        policy: AbyssPolicy,
        dst: &Arc<Buffer>,
        dst_rect: &Rect,
    ) {
        if src_rect.width <= 0 || src_rect.height <= 0 {
            return;
        }

        let mut real_dst = *dst_rect;
        real_dst.width = src_rect.width;
        real_dst.height = src_rect.height;
        let real_dst = match real_dst.intersect(&dst.abyss()) {
            Some(rect) => rect,
            None => return,
        };
        let mut real_src = real_dst;
        real_src.x += src_rect.x - dst_rect.x;
        real_src.y += src_rect.y - dst_rect.y;

        // a source rect with no abyss overlap degenerates to a fill
        if real_src.intersect(&src.abyss()).is_none() {
            let fill = match policy {
                AbyssPolicy::Clamp | AbyssPolicy::Loop if !src.abyss().is_empty() => None,
                AbyssPolicy::Black => Some([0.0f32, 0.0, 0.0, 1.0]),
                AbyssPolicy::White => Some([1.0f32, 1.0, 1.0, 1.0]),
                _ => Some([0.0f32, 0.0, 0.0, 0.0]),
            };
            if let Some(color) = fill {
                let bytes: Vec<u8> = color.iter().flat_map(|v| v.to_ne_bytes()).collect();
                dst.set_color_from_pixel(Some(&real_dst), &bytes, PixelFormat::RGBA_F32);
                return;
            }
        }

        let tile_width = dst.storage.tile_width;
        let tile_height = dst.storage.tile_height;

        let cow_possible = src.storage.format == dst.storage.format
            && src.format() == dst.format()
            && real_src.width >= tile_width
            && real_src.height >= tile_height
            && src.storage.tile_width == tile_width
            && src.storage.tile_height == tile_height
            && !dst.is_linear()
            && Buffer::scan_compatible(src, real_src.x, real_src.y, dst, real_dst.x, real_dst.y);

        if cow_possible {
            let mut cow_rect = real_src
                .intersect(&src.abyss())
                .unwrap_or_default();
            cow_rect.x += real_dst.x - real_src.x;
            cow_rect.y += real_dst.y - real_src.y;

            // shrink to whole aligned tiles
            let mut rem = (cow_rect.x + dst.shift_x) % tile_width;
            if rem > 0 {
                rem -= tile_width;
            }
            cow_rect.x -= rem;
            cow_rect.width += rem;
            rem = (cow_rect.y + dst.shift_y) % tile_height;
            if rem > 0 {
                rem -= tile_height;
            }
            cow_rect.y -= rem;
            cow_rect.height += rem;
            cow_rect.width -= cow_rect.width.rem_euclid(tile_width);
            cow_rect.height -= cow_rect.height.rem_euclid(tile_height);

            if cow_rect.width > 0 && cow_rect.height > 0 {
                {
                    // lock both storages, lesser pointer first
                    let src_storage = Arc::as_ptr(&src.storage) as usize;
                    let dst_storage = Arc::as_ptr(&dst.storage) as usize;
                    let (_g1, _g2) = if src_storage < dst_storage {
                        (src.storage.lock(), dst.storage.lock())
                    } else {
                        (dst.storage.lock(), src.storage.lock())
                    };

                    let mut dst_y = cow_rect.y + dst.shift_y;
                    while dst_y < cow_rect.y + dst.shift_y + cow_rect.height {
                        let mut dst_x = cow_rect.x + dst.shift_x;
                        while dst_x < cow_rect.x + dst.shift_x + cow_rect.width {
                            let src_x =
                                dst_x + (real_src.x - real_dst.x) + (src.shift_x - dst.shift_x);
                            let src_y =
                                dst_y + (real_src.y - real_dst.y) + (src.shift_y - dst.shift_y);

                            let stx = tile_index(src_x, tile_width);
                            let sty = tile_index(src_y, tile_height);
                            let dtx = tile_index(dst_x, tile_width);
                            let dty = tile_index(dst_y, tile_height);

                            if !dst.storage.copy_tile_from(&src.storage, stx, sty, 0, dtx, dty, 0)
                            {
                                match src.storage.get_tile(stx, sty, 0) {
                                    Some(tile) => {
                                        dst.storage.set_tile(dtx, dty, 0, tile.dup());
                                    }
                                    None => log::warn!(
                                        "{}, skipping tile in copy",
                                        Error::TileFetchMiss(stx, sty, 0)
                                    ),
                                }
                            }
                            dst_x += tile_width;
                        }
                        dst_y += tile_height;
                    }

                    dst.storage.damage_rect(&Rect::new(
                        cow_rect.x + dst.shift_x,
                        cow_rect.y + dst.shift_y,
                        cow_rect.width,
                        cow_rect.height,
                    ));
                }

                // the four border strips go through the ordinary path
                for border in border_rects(&real_dst, &cow_rect) {
                    let src_border = Rect::new(
                        real_src.x + (border.x - real_dst.x),
                        real_src.y + (border.y - real_dst.y),
                        border.width,
                        border.height,
                    );
                    copy_rect_iterated(src, &src_border, policy, dst, &border);
                }
            } else {
                copy_rect_iterated(src, &real_src, policy, dst, &real_dst);
            }
        } else {
            copy_rect_iterated(src, &real_src, policy, dst, &real_dst);
        }

        dst.mark_initialized();
        dst.emit_changed(&real_dst);
    }

    /// Runs `tile_func` on every whole tile covered by `rect` and
    /// `rect_func` on the unaligned border strips, then emits one change.
    fn foreach_tile<TF, RF>(self: &Arc<Buffer>, rect: Option<&Rect>, tile_func: TF, rect_func: RF)
    where
        TF: Fn(&Arc<Buffer>, i32, i32),
        RF: Fn(&Arc<Buffer>, &Rect),
    {
        let roi = match rect {
            Some(rect) => *rect,
            None => self.extent(),
        };
        if roi.width <= 0 || roi.height <= 0 {
            return;
        }

        let tile_width = self.storage.tile_width;
        let tile_height = self.storage.tile_height;

        if roi.width >= tile_width && roi.height >= tile_height && !self.is_linear() {
            let mut tile_rect = roi;
            tile_rect.x += self.shift_x;
            tile_rect.y += self.shift_y;

            let mut rem = tile_rect.x % tile_width;
            if rem > 0 {
                rem -= tile_width;
            }
            tile_rect.x -= rem;
            tile_rect.width += rem;
            rem = tile_rect.y % tile_height;
            if rem > 0 {
                rem -= tile_height;
            }
            tile_rect.y -= rem;
            tile_rect.height += rem;
            tile_rect.width -= tile_rect.width.rem_euclid(tile_width);
            tile_rect.height -= tile_rect.height.rem_euclid(tile_height);

            if tile_rect.width > 0 && tile_rect.height > 0 {
                {
                    let _guard = self.storage.lock();
                    let mut y = tile_rect.y;
                    while y < tile_rect.y + tile_rect.height {
                        let mut x = tile_rect.x;
                        while x < tile_rect.x + tile_rect.width {
                            tile_func(
                                self,
                                tile_index(x, tile_width),
                                tile_index(y, tile_height),
                            );
                            x += tile_width;
                        }
                        y += tile_height;
                    }
                    self.storage.damage_rect(&tile_rect);
                }

                tile_rect.x -= self.shift_x;
                tile_rect.y -= self.shift_y;
                for border in border_rects(&roi, &tile_rect) {
                    rect_func(self, &border);
                }
            } else {
                rect_func(self, &roi);
            }
        } else {
            rect_func(self, &roi);
        }

        self.emit_changed(&roi);
    }
}

/// The four strips of `outer` not covered by `inner` (top, bottom, left,
/// right); empty strips are omitted. `inner` must be contained in `outer`.
fn border_rects(outer: &Rect, inner: &Rect) -> Vec<Rect> {
    let mut out = Vec::with_capacity(4);

    let top = Rect::new(outer.x, outer.y, outer.width, inner.y - outer.y);
    if top.height > 0 {
        out.push(top);
    }
    let bottom = Rect::new(
        outer.x,
        inner.y + inner.height,
        outer.width,
        (outer.y + outer.height) - (inner.y + inner.height),
    );
    if bottom.height > 0 {
        out.push(bottom);
    }
    let left = Rect::new(outer.x, inner.y, inner.x - outer.x, inner.height);
    if left.width > 0 && left.height > 0 {
        out.push(left);
    }
    let right = Rect::new(
        inner.x + inner.width,
        inner.y,
        (outer.x + outer.width) - (inner.x + inner.width),
        inner.height,
    );
    if right.width > 0 && right.height > 0 {
        out.push(right);
    }
    out
}

/// Pixel-by-pixel copy through the iterator + read dispatch
fn copy_rect_iterated(
    src: &Arc<Buffer>,
    src_rect: &Rect,
    policy: AbyssPolicy,
    dst: &Arc<Buffer>,
    dst_rect: &Rect,
) {
    if dst_rect.width <= 0 || dst_rect.height <= 0 {
        return;
    }
    let offset_x = src_rect.x - dst_rect.x;
    let offset_y = src_rect.y - dst_rect.y;
    let format = dst.format();

    let mut iter = iterator::BufferIterator::new(
        dst,
        Some(dst_rect),
        0,
        Some(format),
        iterator::Access::Write,
        policy,
        true,
    );
    while iter.next() {
        let item = iter.item(0);
        let mut roi = item.roi;
        roi.x += offset_x;
        roi.y += offset_y;
        let stride = roi.width as usize * format.bytes_per_pixel();
        src.read_dispatch(&roi, item.data_mut(), stride, format, 0, policy);
    }
}
