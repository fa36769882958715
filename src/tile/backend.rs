//! Tile persistence interface
//!
//! A backend persists tiles keyed by `(x, y, z)` indices and fixes the tile
//! geometry and pixel format of everything above it. The engine itself only
//! ships [`RamBackend`]; swap-file or remote backends implement the same
//! trait externally.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;

use super::Tile;
use crate::format::PixelFormat;
use crate::rect::Rect;

/// Storage provider for tiles, keyed by `(x, y, z)`
pub trait TileBackend: Send + Sync {
    fn tile_width(&self) -> i32;
    fn tile_height(&self) -> i32;
    fn format(&self) -> PixelFormat;

    fn tile_size(&self) -> usize {
        self.tile_width() as usize * self.tile_height() as usize
            * self.format().bytes_per_pixel()
    }

    /// Fetches a tile; the returned tile must be safe for the caller to
    /// write after a COW unshare (i.e. share bytes, not the tile object).
    fn get(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>>;

    /// Persists a snapshot of `tile`
    fn set(&self, x: i32, y: i32, z: i32, tile: &Arc<Tile>);

    fn exist(&self, x: i32, y: i32, z: i32) -> bool;

    fn void(&self, x: i32, y: i32, z: i32);

    fn flush(&self) {}

    /// Advises the backend of the logical extent being persisted
    fn set_extent(&self, extent: Rect);

    fn extent(&self) -> Rect;
}

/// In-memory backend; the default storage for new buffers
pub struct RamBackend {
    tile_width: i32,
    tile_height: i32,
    format: PixelFormat,
    tiles: DashMap<(i32, i32, i32), Arc<Tile>>,
    extent: Mutex<Rect>,
}

impl RamBackend {
    pub fn new(tile_width: i32, tile_height: i32, format: PixelFormat) -> Self {
        Self {
            tile_width,
            tile_height,
            format,
            tiles: DashMap::new(),
            extent: Mutex::new(Rect::default()),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

impl TileBackend for RamBackend {
    fn tile_width(&self) -> i32 {
        self.tile_width
    }

    fn tile_height(&self) -> i32 {
        self.tile_height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn get(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>> {
        self.tiles.get(&(x, y, z)).map(|entry| {
            let tile = entry.value().dup();
            tile.mark_as_stored();
            tile
        })
    }

    fn set(&self, x: i32, y: i32, z: i32, tile: &Arc<Tile>) {
        let snapshot = tile.dup();
        snapshot.mark_as_stored();
        tile.mark_as_stored();
        self.tiles.insert((x, y, z), snapshot);
    }

    fn exist(&self, x: i32, y: i32, z: i32) -> bool {
        self.tiles.contains_key(&(x, y, z))
    }

    fn void(&self, x: i32, y: i32, z: i32) {
        self.tiles.remove(&(x, y, z));
    }

    fn set_extent(&self, extent: Rect) {
        *self.extent.lock().unwrap() = extent;
    }

    fn extent(&self) -> Rect {
        *self.extent.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RamBackend {
        RamBackend::new(32, 32, PixelFormat::RGBA_U8)
    }

    #[test]
    fn test_tile_size() {
        assert_eq!(backend().tile_size(), 32 * 32 * 4);
    }

    #[test]
    fn test_set_get_round_trip() {
        let backend = backend();
        let tile = Tile::new(backend.tile_size());
        tile.lock();
        tile.data_mut()[0] = 99;
        tile.unlock_no_void();

        backend.set(1, 2, 0, &tile);
        assert!(backend.exist(1, 2, 0));
        assert!(tile.is_stored());

        let fetched = backend.get(1, 2, 0).unwrap();
        fetched.read_lock();
        assert_eq!(fetched.data()[0], 99);
        fetched.read_unlock();
        assert!(fetched.is_stored());
    }

    #[test]
    fn test_get_returns_cow_snapshot() {
        let backend = backend();
        let tile = Tile::new(backend.tile_size());
        backend.set(0, 0, 0, &tile);

        let fetched = backend.get(0, 0, 0).unwrap();
        fetched.lock();
        fetched.data_mut()[0] = 42;
        fetched.unlock_no_void();

        // the backend's copy is unaffected
        let again = backend.get(0, 0, 0).unwrap();
        again.read_lock();
        assert_eq!(again.data()[0], 0);
        again.read_unlock();
    }

    #[test]
    fn test_void() {
        let backend = backend();
        let tile = Tile::new(backend.tile_size());
        backend.set(0, 0, 0, &tile);
        backend.void(0, 0, 0);
        assert!(!backend.exist(0, 0, 0));
        assert!(backend.get(0, 0, 0).is_none());
    }

    #[test]
    fn test_extent() {
        let backend = backend();
        backend.set_extent(Rect::new(1, 2, 3, 4));
        assert_eq!(backend.extent(), Rect::new(1, 2, 3, 4));
    }
}
