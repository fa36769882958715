//! Mipmap tile synthesis
//!
//! A level-z tile covers the same pixel count as four level-(z−1) tiles.
//! On a level-z miss the storage synthesizes the tile by box-downscaling
//! each existing child into its quadrant; children that exist nowhere in
//! the chain leave their quadrant zeroed.

use std::sync::Arc;

use super::empty;
use super::storage::TileStorage;
use super::Tile;
use crate::error::Error;
use crate::ops::downscale_2x2;

pub(crate) fn synthesize(storage: &TileStorage, x: i32, y: i32, z: i32) -> Arc<Tile> {
    debug_assert!(z >= 1);

    let tile = empty::new_tile(storage.tile_size);
    tile.lock();

    let tile_width = storage.tile_width as usize;
    let tile_height = storage.tile_height as usize;
    let bpp = storage.format.bytes_per_pixel();
    let stride = tile_width * bpp;
    let half_width = tile_width / 2;
    let half_height = tile_height / 2;

    for j in 0..2i32 {
        for i in 0..2i32 {
            let child_x = 2 * x + i;
            let child_y = 2 * y + j;

            // a level-0 child that exists nowhere stays a blank quadrant;
            // deeper levels recurse so cache-only pyramids keep working
            if z == 1 && !storage.exist(child_x, child_y, 0) {
                continue;
            }

            let Some(child) = storage.get_tile(child_x, child_y, z - 1) else {
                log::warn!(
                    "{}, leaving quadrant blank",
                    Error::TileFetchMiss(child_x, child_y, z - 1)
                );
                continue;
            };
            child.read_lock();
            let dst_offset = j as usize * half_height * stride + i as usize * half_width * bpp;
            downscale_2x2(
                storage.format,
                tile_width,
                tile_height,
                child.data(),
                stride,
                &mut tile.data_mut()[dst_offset..],
                stride,
            );
            child.read_unlock();
        }
    }

    tile.set_damage(0);
    tile.unlock_no_void();
    // re-synthesizable on demand, no need to persist
    tile.mark_as_stored();
    tile
}
