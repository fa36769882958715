//! Tile storage: the handler chain root
//!
//! A [`TileStorage`] fixes the tile geometry and format for every buffer
//! sharing it, and resolves tile commands through a fixed chain:
//!
//! ```text
//! user handlers → cache → zoom → empty → backend
//! ```
//!
//! User handlers run first and may short-circuit reads (procedural or
//! externally-compressed sources). The cache serves repeats. Level-z misses
//! are synthesized from level-(z−1) children by the zoom step, and whatever
//! is left resolves to the backend or a shared zero tile.
//!
//! A recursive mutex guards multi-step chain operations so they stay atomic
//! with respect to concurrent eviction; zoom synthesis re-enters it while
//! fetching children. A single hot-tile slot accelerates 1×1 pixel access.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, ThreadId};

use super::backend::TileBackend;
use super::cache::{CacheHandler, DEFAULT_CACHE_BYTES};
use super::empty::{self, EmptyHandler};
use super::zoom;
use super::{damage_bits, Tile};
use crate::rect::{tile_index, Rect};

/// Commands a user handler may intercept
pub enum TileCommand<'a> {
    Get,
    Set(&'a Arc<Tile>),
    Void,
    Exist,
    Flush,
}

/// Replies from a user handler; `None` from [`TileHandler::command`] means
/// "not mine, keep going source-ward".
pub enum TileReply {
    Tile(Arc<Tile>),
    /// The handler owns this coordinate but cannot produce the tile;
    /// the chain reports a miss instead of falling through.
    Missing,
    Exists(bool),
    Handled,
}

/// A user-installed tile handler, consulted before the cache
pub trait TileHandler: Send + Sync {
    fn command(&self, cmd: &TileCommand, x: i32, y: i32, z: i32) -> Option<TileReply>;

    /// Whether this handler tracks tile validity internally. When true,
    /// buffer copies must fetch tiles through `Get` instead of cloning
    /// cache entries directly.
    fn hides_tile_validity(&self) -> bool {
        true
    }
}

/// A recursive mutex: the owner thread may re-lock without deadlocking.
/// Chain operations hold it across compound steps and zoom synthesis
/// re-enters during child fetches.
pub struct RecMutex {
    state: Mutex<(Option<ThreadId>, usize)>,
    cond: Condvar,
}

pub struct RecMutexGuard<'a> {
    mutex: &'a RecMutex,
}

impl RecMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((None, 0)),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> RecMutexGuard<'_> {
        self.raw_lock();
        RecMutexGuard { mutex: self }
    }

    /// Acquires without a guard; pair with [`RecMutex::raw_unlock`]. Used
    /// where the lock must outlive a lexical scope (iterator steps).
    pub fn raw_lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        while let (Some(owner), _) = *state {
            if owner == me {
                break;
            }
            state = self.cond.wait(state).unwrap();
        }
        state.0 = Some(me);
        state.1 += 1;
    }

    pub fn raw_unlock(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.0 == Some(thread::current().id()));
        state.1 -= 1;
        if state.1 == 0 {
            state.0 = None;
            self.cond.notify_one();
        }
    }
}

impl Default for RecMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.raw_unlock();
    }
}

pub struct TileStorage {
    pub tile_width: i32,
    pub tile_height: i32,
    pub tile_size: usize,
    pub format: crate::format::PixelFormat,

    backend: Arc<dyn TileBackend>,
    cache: CacheHandler,
    empty: EmptyHandler,
    user_handlers: RwLock<Vec<Arc<dyn TileHandler>>>,

    mutex: RecMutex,
    hot_tile: Mutex<Option<(i32, i32, i32, Arc<Tile>)>>,
    /// Highest mipmap level ever requested; bounds damage propagation
    seen_zoom: AtomicI32,
}

impl TileStorage {
    pub fn new(backend: Arc<dyn TileBackend>, initialized: bool) -> Arc<TileStorage> {
        let tile_width = backend.tile_width();
        let tile_height = backend.tile_height();
        let format = backend.format();
        let tile_size = backend.tile_size();

        Arc::new(TileStorage {
            tile_width,
            tile_height,
            tile_size,
            format,
            cache: CacheHandler::new(Arc::clone(&backend), DEFAULT_CACHE_BYTES),
            empty: EmptyHandler::new(Arc::clone(&backend), initialized),
            user_handlers: RwLock::new(Vec::new()),
            backend,
            mutex: RecMutex::new(),
            hot_tile: Mutex::new(None),
            seen_zoom: AtomicI32::new(0),
        })
    }

    /// Locks the storage for a compound chain operation
    pub fn lock(&self) -> RecMutexGuard<'_> {
        self.mutex.lock()
    }

    pub fn backend(&self) -> &Arc<dyn TileBackend> {
        &self.backend
    }

    pub(crate) fn cache(&self) -> &CacheHandler {
        &self.cache
    }

    pub fn add_handler(&self, handler: Arc<dyn TileHandler>) {
        self.user_handlers.write().unwrap().push(handler);
    }

    pub fn remove_handler(&self, handler: &Arc<dyn TileHandler>) {
        self.user_handlers
            .write()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn n_user_handlers(&self) -> usize {
        self.user_handlers.read().unwrap().len()
    }

    /// Fetches the tile at `(x, y, z)` for reading.
    ///
    /// `None` is a genuine miss: a user handler owns the coordinate but
    /// could not produce the tile. Callers warn and skip the affected
    /// scan column.
    pub fn get_tile(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>> {
        self.get_tile_full(x, y, z, true)
    }

    /// Fetches a tile the caller is about to overwrite completely; the
    /// previous contents need not be produced.
    pub fn get_tile_discard(&self, x: i32, y: i32, z: i32) -> Option<Arc<Tile>> {
        self.get_tile_full(x, y, z, false)
    }

    fn get_tile_full(&self, x: i32, y: i32, z: i32, preserve_data: bool) -> Option<Arc<Tile>> {
        let _guard = self.mutex.lock();

        if z > 0 {
            self.seen_zoom.fetch_max(z, Ordering::Relaxed);
        }

        {
            let handlers = self.user_handlers.read().unwrap();
            for handler in handlers.iter() {
                match handler.command(&TileCommand::Get, x, y, z) {
                    Some(TileReply::Tile(tile)) => return Some(tile),
                    Some(TileReply::Missing) => return None,
                    _ => {}
                }
            }
        }

        if let Some(tile) = self.cache.get(x, y, z) {
            // a damaged mipmap tile is stale; rebuild it from its children
            if z > 0 && preserve_data && tile.damage() != 0 {
                let fresh = zoom::synthesize(self, x, y, z);
                self.cache.insert(x, y, z, Arc::clone(&fresh));
                return Some(fresh);
            }
            return Some(tile);
        }

        let tile = if !preserve_data {
            empty::new_tile(self.tile_size)
        } else if z > 0 {
            match self.backend.get(x, y, z) {
                Some(tile) if tile.damage() == 0 => tile,
                _ => zoom::synthesize(self, x, y, z),
            }
        } else {
            self.empty.get_tile(x, y, z)
        };

        self.cache.insert(x, y, z, Arc::clone(&tile));
        Some(tile)
    }

    pub fn exist(&self, x: i32, y: i32, z: i32) -> bool {
        let handlers = self.user_handlers.read().unwrap();
        for handler in handlers.iter() {
            match handler.command(&TileCommand::Exist, x, y, z) {
                Some(TileReply::Exists(exists)) => return exists,
                Some(TileReply::Missing) => return false,
                _ => {}
            }
        }
        drop(handlers);

        self.cache.contains(x, y, z) || self.backend.exist(x, y, z)
    }

    /// Installs `tile` at `(x, y, z)` in the cache
    pub fn set_tile(&self, x: i32, y: i32, z: i32, tile: Arc<Tile>) {
        let _guard = self.mutex.lock();
        {
            let handlers = self.user_handlers.read().unwrap();
            for handler in handlers.iter() {
                handler.command(&TileCommand::Set(&tile), x, y, z);
            }
        }
        self.cache.insert(x, y, z, tile);
    }

    pub fn void(&self, x: i32, y: i32, z: i32) {
        let _guard = self.mutex.lock();
        {
            let handlers = self.user_handlers.read().unwrap();
            for handler in handlers.iter() {
                handler.command(&TileCommand::Void, x, y, z);
            }
        }
        self.cache.remove(x, y, z);
        self.backend.void(x, y, z);
    }

    /// Flushes unstored tiles and the backend itself
    pub fn flush(&self) {
        let _guard = self.mutex.lock();
        {
            let handlers = self.user_handlers.read().unwrap();
            for handler in handlers.iter() {
                handler.command(&TileCommand::Flush, 0, 0, 0);
            }
        }
        self.cache.flush();
    }

    /// Marks mipmap tiles overlapping `rect` (tile-grid pixel coordinates,
    /// level 0) as damaged so the zoom step re-synthesizes them.
    pub fn damage_rect(&self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        let max_z = self.seen_zoom.load(Ordering::Relaxed);
        for z in 1..=max_z {
            let factor = 1i64 << z;
            let x0 = (rect.x as i64).div_euclid(factor) as i32;
            let y0 = (rect.y as i64).div_euclid(factor) as i32;
            let x1 = ((rect.x as i64 + rect.width as i64 - 1).div_euclid(factor)) as i32;
            let y1 = ((rect.y as i64 + rect.height as i64 - 1).div_euclid(factor)) as i32;

            let tx0 = tile_index(x0, self.tile_width);
            let tx1 = tile_index(x1, self.tile_width);
            let ty0 = tile_index(y0, self.tile_height);
            let ty1 = tile_index(y1, self.tile_height);

            for ty in ty0..=ty1 {
                for tx in tx0..=tx1 {
                    if let Some(tile) = self.cache.peek(tx, ty, z) {
                        let bits = damage_bits(
                            x0 - tx * self.tile_width,
                            y0 - ty * self.tile_height,
                            x1 - x0 + 1,
                            y1 - y0 + 1,
                            self.tile_width,
                            self.tile_height,
                        );
                        tile.add_damage(bits);
                    }
                    if self.backend.exist(tx, ty, z) {
                        self.backend.void(tx, ty, z);
                    }
                }
            }
        }
    }

    /// Atomically claims the hot tile for exclusive use
    pub fn steal_hot_tile(&self) -> Option<(i32, i32, i32, Arc<Tile>)> {
        self.hot_tile.lock().unwrap().take()
    }

    /// Returns a tile to the hot slot; dropped if another tile moved in
    pub fn take_hot_tile(&self, x: i32, y: i32, z: i32, tile: Arc<Tile>) {
        let mut hot = self.hot_tile.lock().unwrap();
        if hot.is_none() {
            *hot = Some((x, y, z, tile));
        }
    }

    /// Drops the hot tile, if any
    pub fn drop_hot_tile(&self) {
        self.hot_tile.lock().unwrap().take();
    }

    /// Whether any user handler conceals tile validity from the chain
    pub fn has_opaque_user_handlers(&self) -> bool {
        self.user_handlers
            .read()
            .unwrap()
            .iter()
            .any(|h| h.hides_tile_validity())
    }

    /// COW-duplicates the tile at `(x, y, z)` in `src` into this storage's
    /// cache. Returns false when no fast copy is possible.
    pub fn copy_tile_from(
        &self,
        src: &TileStorage,
        sx: i32,
        sy: i32,
        sz: i32,
        dx: i32,
        dy: i32,
        dz: i32,
    ) -> bool {
        if src.has_opaque_user_handlers() {
            return false;
        }
        match src.cache.copy_out(sx, sy, sz) {
            Some(tile) => {
                self.cache.insert(dx, dy, dz, tile);
                true
            }
            None => false,
        }
    }
}
