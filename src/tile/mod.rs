//! Tiles: fixed-size pixel blocks with copy-on-write sharing
//!
//! A [`Tile`] owns (or shares) a byte block of exactly `size` bytes. Clones
//! made with [`Tile::dup`] share the underlying bytes; acquiring the write
//! lock on a tile whose bytes are shared physically duplicates them first,
//! so writers never disturb other holders. Locking is explicit rather than
//! guard-based because lock lifetimes here span iterator steps, not lexical
//! scopes.
//!
//! # Locking protocol
//!
//! * [`Tile::read_lock`] / [`Tile::read_unlock`] — any number of readers.
//! * [`Tile::lock`] — single writer, excludes readers, performs the COW
//!   unshare.
//! * [`Tile::unlock`] — releases the write lock and marks the whole tile
//!   damaged so coarser mipmap levels re-synthesize it.
//! * [`Tile::unlock_no_void`] — releases without touching damage; used by
//!   the rectangle write path, which records damage at rect granularity.
//!
//! [`Tile::data`] and [`Tile::data_mut`] must only be called while the
//! corresponding lock is held.

pub mod backend;
pub mod cache;
pub mod empty;
pub mod storage;
pub mod zoom;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Shared byte block behind one or more tiles
pub struct TileBytes {
    data: UnsafeCell<Box<[u8]>>,
}

// Mutation only happens through a tile's write lock, which guarantees the
// block is not shared and no readers are active.
unsafe impl Sync for TileBytes {}
unsafe impl Send for TileBytes {}

impl TileBytes {
    pub fn zeroed(size: usize) -> Arc<TileBytes> {
        Arc::new(TileBytes {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    fn len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }
}

struct TileState {
    bytes: Arc<TileBytes>,
    readers: usize,
    writer: bool,
}

/// A single fixed-size block of pixel bytes
pub struct Tile {
    state: Mutex<TileState>,
    cond: Condvar,
    size: usize,
    /// One bit per region of an 8×8 subdivision; a set bit means the
    /// region is not guaranteed current.
    damage: AtomicU64,
    /// Whether the backend already holds these bytes
    stored: AtomicBool,
    /// Whether the bytes are (a view of) the shared zero block
    is_zero: AtomicBool,
}

impl Tile {
    /// Allocates a zero-filled tile of `size` bytes
    pub fn new(size: usize) -> Arc<Tile> {
        Tile::with_bytes(TileBytes::zeroed(size), size, false)
    }

    pub(crate) fn with_bytes(bytes: Arc<TileBytes>, size: usize, is_zero: bool) -> Arc<Tile> {
        assert!(bytes.len() >= size);
        Arc::new(Tile {
            state: Mutex::new(TileState {
                bytes,
                readers: 0,
                writer: false,
            }),
            cond: Condvar::new(),
            size,
            damage: AtomicU64::new(0),
            stored: AtomicBool::new(false),
            is_zero: AtomicBool::new(is_zero),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Clones the tile as a shallow reference to the same bytes
    pub fn dup(&self) -> Arc<Tile> {
        let state = self.state.lock().unwrap();
        let tile = Tile::with_bytes(
            Arc::clone(&state.bytes),
            self.size,
            self.is_zero.load(Ordering::Relaxed),
        );
        tile.damage
            .store(self.damage.load(Ordering::Relaxed), Ordering::Relaxed);
        tile
    }

    pub fn read_lock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub fn read_unlock(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Acquires the write lock, waiting out readers and other writers.
    ///
    /// If the byte block is shared (a COW clone, or the global zero block)
    /// it is physically duplicated before the lock is granted.
    pub fn lock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;

        if Arc::strong_count(&state.bytes) > 1 || self.is_zero.load(Ordering::Relaxed) {
            let fresh = TileBytes::zeroed(self.size);
            unsafe {
                std::ptr::copy_nonoverlapping(state.bytes.ptr(), fresh.ptr(), self.size);
            }
            state.bytes = fresh;
            self.is_zero.store(false, Ordering::Relaxed);
        }

        // freshly written bytes will need persisting again
        self.stored.store(false, Ordering::Relaxed);
    }

    /// Releases the write lock and marks the tile damaged everywhere
    pub fn unlock(&self) {
        self.damage.store(!0u64, Ordering::Relaxed);
        self.unlock_no_void();
    }

    /// Releases the write lock without touching the damage mask
    pub fn unlock_no_void(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.writer);
        state.writer = false;
        self.cond.notify_all();
    }

    /// Read access to the pixel bytes; a read or write lock must be held
    pub fn data(&self) -> &[u8] {
        let state = self.state.lock().unwrap();
        debug_assert!(state.readers > 0 || state.writer);
        let ptr = state.bytes.ptr();
        unsafe { std::slice::from_raw_parts(ptr, self.size) }
    }

    /// Write access to the pixel bytes; the write lock must be held
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8] {
        let state = self.state.lock().unwrap();
        debug_assert!(state.writer);
        let ptr = state.bytes.ptr();
        unsafe { std::slice::from_raw_parts_mut(ptr, self.size) }
    }

    /// Whether the byte block is currently shared with other tiles
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.state.lock().unwrap().bytes) > 1
    }

    pub fn is_zero_tile(&self) -> bool {
        self.is_zero.load(Ordering::Relaxed)
    }

    pub fn damage(&self) -> u64 {
        self.damage.load(Ordering::Relaxed)
    }

    pub fn set_damage(&self, damage: u64) {
        self.damage.store(damage, Ordering::Relaxed);
    }

    pub fn add_damage(&self, bits: u64) {
        self.damage.fetch_or(bits, Ordering::Relaxed);
    }

    /// Tells the cache the backend already holds these bytes
    pub fn mark_as_stored(&self) {
        self.stored.store(true, Ordering::Relaxed);
    }

    pub fn is_stored(&self) -> bool {
        self.stored.load(Ordering::Relaxed)
    }
}

/// Damage bits of the 8×8 subdivision of a `tile_width × tile_height` tile
/// touched by `rect` (tile-local coordinates).
pub fn damage_bits(
    rect_x: i32,
    rect_y: i32,
    rect_w: i32,
    rect_h: i32,
    tile_width: i32,
    tile_height: i32,
) -> u64 {
    if rect_w <= 0 || rect_h <= 0 {
        return 0;
    }
    let cell_w = (tile_width + 7) / 8;
    let cell_h = (tile_height + 7) / 8;
    let cx0 = (rect_x.max(0) / cell_w).min(7);
    let cy0 = (rect_y.max(0) / cell_h).min(7);
    let cx1 = (((rect_x + rect_w - 1).max(0)) / cell_w).min(7);
    let cy1 = (((rect_y + rect_h - 1).max(0)) / cell_h).min(7);

    let mut bits = 0u64;
    for cy in cy0..=cy1 {
        for cx in cx0..=cx1 {
            bits |= 1u64 << (cy * 8 + cx);
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let tile = Tile::new(64);
        tile.read_lock();
        assert!(tile.data().iter().all(|&b| b == 0));
        tile.read_unlock();
    }

    #[test]
    fn test_write_and_read_back() {
        let tile = Tile::new(16);
        tile.lock();
        tile.data_mut()[3] = 0xAA;
        tile.unlock_no_void();

        tile.read_lock();
        assert_eq!(tile.data()[3], 0xAA);
        tile.read_unlock();
    }

    #[test]
    fn test_dup_shares_bytes() {
        let tile = Tile::new(16);
        tile.lock();
        tile.data_mut()[0] = 7;
        tile.unlock_no_void();

        let clone = tile.dup();
        assert!(tile.is_shared());
        assert!(clone.is_shared());

        clone.read_lock();
        assert_eq!(clone.data()[0], 7);
        clone.read_unlock();
    }

    #[test]
    fn test_cow_unshare_on_write_lock() {
        let tile = Tile::new(16);
        tile.lock();
        tile.data_mut()[0] = 1;
        tile.unlock_no_void();

        let clone = tile.dup();

        // writing the clone must not disturb the original
        clone.lock();
        assert!(!clone.is_shared());
        clone.data_mut()[0] = 2;
        clone.unlock_no_void();

        tile.read_lock();
        assert_eq!(tile.data()[0], 1);
        tile.read_unlock();
        clone.read_lock();
        assert_eq!(clone.data()[0], 2);
        clone.read_unlock();
    }

    #[test]
    fn test_unlock_marks_damage() {
        let tile = Tile::new(16);
        assert_eq!(tile.damage(), 0);
        tile.lock();
        tile.unlock();
        assert_eq!(tile.damage(), !0u64);

        let tile = Tile::new(16);
        tile.lock();
        tile.unlock_no_void();
        assert_eq!(tile.damage(), 0);
    }

    #[test]
    fn test_write_clears_stored() {
        let tile = Tile::new(16);
        tile.mark_as_stored();
        assert!(tile.is_stored());
        tile.lock();
        tile.unlock_no_void();
        assert!(!tile.is_stored());
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::atomic::AtomicUsize;

        let tile = Tile::new(1024);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tile = Arc::clone(&tile);
                let peak = Arc::clone(&peak);
                let active = Arc::clone(&active);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tile.read_lock();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::hint::black_box(tile.data()[0]);
                        active.fetch_sub(1, Ordering::SeqCst);
                        tile.read_unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_writers_exclude() {
        let tile = Tile::new(8);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let tile = Arc::clone(&tile);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tile.lock();
                        let data = tile.data_mut();
                        data[0] = i;
                        data[1] = i;
                        tile.unlock_no_void();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        tile.read_lock();
        // both bytes written under one lock must agree
        assert_eq!(tile.data()[0], tile.data()[1]);
        tile.read_unlock();
    }

    #[test]
    fn test_damage_bits_full() {
        assert_eq!(damage_bits(0, 0, 64, 64, 64, 64), !0u64);
    }

    #[test]
    fn test_damage_bits_corner() {
        // top-left cell of a 64x64 tile subdivides into 8x8 cells
        assert_eq!(damage_bits(0, 0, 8, 8, 64, 64), 1);
        assert_eq!(damage_bits(56, 56, 8, 8, 64, 64), 1u64 << 63);
    }

    #[test]
    fn test_damage_bits_row() {
        assert_eq!(damage_bits(0, 0, 64, 8, 64, 64), 0xFF);
    }

    #[test]
    fn test_damage_bits_empty() {
        assert_eq!(damage_bits(0, 0, 0, 5, 64, 64), 0);
    }
}
