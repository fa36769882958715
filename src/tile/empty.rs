//! Empty-tile supplier
//!
//! Misses at the bottom of the handler chain resolve to zero-filled tiles.
//! Tiles small enough to fit the shared zero block are handed out as COW
//! clones of one immortal process-global allocation, so the cache
//! deduplicates them naturally and their bytes are never copied until
//! someone actually writes.

use std::sync::{Arc, OnceLock};

use super::backend::TileBackend;
use super::{Tile, TileBytes};

/// Size of the process-global zero block: room for 128×128 pixels of four
/// doubles each, the largest common tile configuration.
const COMMON_EMPTY_SIZE: usize = 8 * 4 * 128 * 128;

fn common_zero_block() -> &'static Arc<TileBytes> {
    static BLOCK: OnceLock<Arc<TileBytes>> = OnceLock::new();
    BLOCK.get_or_init(|| TileBytes::zeroed(COMMON_EMPTY_SIZE))
}

/// Allocates a zero-filled tile of `size` bytes, backed by the shared zero
/// block whenever it fits.
pub fn new_tile(size: usize) -> Arc<Tile> {
    if size > COMMON_EMPTY_SIZE {
        Tile::with_bytes(TileBytes::zeroed(size), size, true)
    } else {
        Tile::with_bytes(Arc::clone(common_zero_block()), size, true)
    }
}

/// Bottom-of-chain handler: consult the backend, then fabricate emptiness
pub struct EmptyHandler {
    backend: Arc<dyn TileBackend>,
    /// Whether the buffer's contents start out defined. Uninitialized
    /// buffers get their fresh level-0 tiles marked fully damaged, since
    /// their bytes carry no information yet.
    initialized: bool,
}

impl EmptyHandler {
    pub fn new(backend: Arc<dyn TileBackend>, initialized: bool) -> Self {
        Self {
            backend,
            initialized,
        }
    }

    pub fn get_tile(&self, x: i32, y: i32, z: i32) -> Arc<Tile> {
        if let Some(tile) = self.backend.get(x, y, z) {
            return tile;
        }

        let tile = new_tile(self.backend.tile_size());
        if z == 0 && !self.initialized {
            tile.set_damage(!0u64);
        }
        // no need to persist: another empty tile appears on demand
        tile.mark_as_stored();
        tile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::tile::backend::RamBackend;

    fn handler(initialized: bool) -> EmptyHandler {
        let backend = Arc::new(RamBackend::new(16, 16, PixelFormat::RGBA_U8));
        EmptyHandler::new(backend, initialized)
    }

    #[test]
    fn test_small_tiles_share_zero_block() {
        let a = new_tile(1024);
        let b = new_tile(1024);
        assert!(a.is_zero_tile());
        assert!(b.is_zero_tile());
        assert!(a.is_shared());
        assert!(b.is_shared());
    }

    #[test]
    fn test_large_tile_owns_bytes() {
        let t = new_tile(COMMON_EMPTY_SIZE + 1);
        assert!(t.is_zero_tile());
        t.read_lock();
        assert_eq!(t.data().len(), COMMON_EMPTY_SIZE + 1);
        t.read_unlock();
    }

    #[test]
    fn test_write_unshares_zero_block() {
        let t = new_tile(64);
        t.lock();
        t.data_mut()[0] = 1;
        t.unlock_no_void();
        assert!(!t.is_zero_tile());

        // the global block is untouched
        let fresh = new_tile(64);
        fresh.read_lock();
        assert!(fresh.data().iter().all(|&b| b == 0));
        fresh.read_unlock();
    }

    #[test]
    fn test_miss_yields_zero_tile() {
        let h = handler(true);
        let t = h.get_tile(5, 5, 0);
        assert!(t.is_zero_tile());
        assert!(t.is_stored());
        assert_eq!(t.damage(), 0);
        assert_eq!(t.size(), 16 * 16 * 4);
    }

    #[test]
    fn test_uninitialized_marks_damage() {
        let h = handler(false);
        assert_eq!(h.get_tile(0, 0, 0).damage(), !0u64);
        // only level 0
        assert_eq!(h.get_tile(0, 0, 1).damage(), 0);
    }

    #[test]
    fn test_backend_tile_wins() {
        let backend = Arc::new(RamBackend::new(16, 16, PixelFormat::RGBA_U8));
        let stored = Tile::new(backend.tile_size());
        stored.lock();
        stored.data_mut()[7] = 7;
        stored.unlock_no_void();
        backend.set(2, 3, 0, &stored);

        let h = EmptyHandler::new(backend, true);
        let t = h.get_tile(2, 3, 0);
        assert!(!t.is_zero_tile());
        t.read_lock();
        assert_eq!(t.data()[7], 7);
        t.read_unlock();
    }
}
