//! In-memory tile cache handler
//!
//! A bounded, approximately-LRU cache over `(x, y, z)` keys. Lookups and
//! inserts are lock-free on the map; recency flows through a queue that is
//! drained during eviction. Unstored tiles are written back to the backend
//! before they are dropped, so evicting never loses data.
//!
//! Clones of the shared zero tile are excluded from size accounting: they
//! are dedup'd views of one immortal block and their nominal sizes would
//! not add up to anything real.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;

use super::backend::TileBackend;
use super::Tile;

/// Default cache budget per tile storage
pub const DEFAULT_CACHE_BYTES: usize = 128 * 1024 * 1024;

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size_bytes: usize,
    pub tile_count: usize,
}

pub struct CacheHandler {
    tiles: DashMap<(i32, i32, i32), Arc<Tile>>,
    lru: SegQueue<(i32, i32, i32)>,
    backend: Arc<dyn TileBackend>,
    max_bytes: usize,
    current_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheHandler {
    pub fn new(backend: Arc<dyn TileBackend>, max_bytes: usize) -> Self {
        Self {
            tiles: DashMap::new(),
            lru: SegQueue::new(),
            backend,
            max_bytes: max_bytes.max(1),
            current_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn accounted_size(tile: &Tile) -> usize {
        if tile.is_zero_tile() {
            0
        } else {
            tile.size()
        }
    }

    pub fn get(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>> {
        let key = (x, y, z);
        if let Some(entry) = self.tiles.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.lru.push(key);
            Some(Arc::clone(entry.value()))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Looks up without touching recency or statistics
    pub fn peek(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>> {
        self.tiles.get(&(x, y, z)).map(|e| Arc::clone(e.value()))
    }

    pub fn insert(&self, x: i32, y: i32, z: i32, tile: Arc<Tile>) {
        let key = (x, y, z);
        let size = Self::accounted_size(&tile);
        let tile_ptr = Arc::as_ptr(&tile);

        self.evict_for(size);

        if let Some(old) = self.tiles.insert(key, tile) {
            self.current_bytes
                .fetch_sub(Self::accounted_size(&old), Ordering::Relaxed);
            if Arc::as_ptr(&old) != tile_ptr {
                self.write_back(key, &old);
            }
        }
        self.current_bytes.fetch_add(size, Ordering::Relaxed);
        self.lru.push(key);
    }

    pub fn remove(&self, x: i32, y: i32, z: i32) {
        if let Some((_, tile)) = self.tiles.remove(&(x, y, z)) {
            self.current_bytes
                .fetch_sub(Self::accounted_size(&tile), Ordering::Relaxed);
        }
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        self.tiles.contains_key(&(x, y, z))
    }

    /// Duplicates the tile at `(x, y, z)` as a COW clone; the cheap half of
    /// buffer-to-buffer copies.
    pub fn copy_out(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>> {
        self.tiles.get(&(x, y, z)).map(|entry| entry.value().dup())
    }

    /// Pushes every unstored tile to the backend
    pub fn flush(&self) {
        for entry in self.tiles.iter() {
            let (x, y, z) = *entry.key();
            let tile = entry.value();
            if !tile.is_stored() {
                tile.read_lock();
                self.backend.set(x, y, z, tile);
                tile.read_unlock();
            }
        }
        self.backend.flush();
    }

    pub fn clear(&self) {
        self.tiles.clear();
        while self.lru.pop().is_some() {}
        self.current_bytes.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size_bytes: self.current_bytes.load(Ordering::Relaxed),
            tile_count: self.tiles.len(),
        }
    }

    /// Keys of all resident tiles at mipmap level `z`
    pub fn keys_at_level(&self, z: i32) -> Vec<(i32, i32)> {
        self.tiles
            .iter()
            .filter(|e| e.key().2 == z)
            .map(|e| (e.key().0, e.key().1))
            .collect()
    }

    fn write_back(&self, key: (i32, i32, i32), tile: &Arc<Tile>) {
        if !tile.is_stored() {
            tile.read_lock();
            self.backend.set(key.0, key.1, key.2, tile);
            tile.read_unlock();
        }
    }

    fn evict_for(&self, incoming: usize) {
        let target = self.max_bytes.saturating_sub(incoming);
        while self.current_bytes.load(Ordering::Relaxed) > target {
            let key = match self.lru.pop() {
                Some(key) => key,
                None => break,
            };
            if let Some((_, tile)) = self.tiles.remove(&key) {
                self.current_bytes
                    .fetch_sub(Self::accounted_size(&tile), Ordering::Relaxed);
                self.write_back(key, &tile);
            }
        }
    }
}
