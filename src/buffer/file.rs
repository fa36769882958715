//! Buffer file format
//!
//! A saved buffer is a fixed header, a singly-linked chain of index
//! blocks, and raw tile payloads:
//!
//! ```text
//! "GEGL" | flags | next | tile_w tile_h bpp | w h x y | description[64]
//! ```
//!
//! Each index record is a `BufferBlock { length, next, flags }` header
//! followed, for tile records, by `x, y, z, offset`. Integers are
//! little-endian. Tiles are laid out in Morton (Z-order) of their indices;
//! a `next` of zero terminates the chain. Unknown block kinds are skipped
//! by length, so newer writers stay readable.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use super::Buffer;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::rect::{tile_index, Rect};

const MAGIC: [u8; 4] = *b"GEGL";

const FLAG_HEADER: u32 = 1;
const FLAG_TILE: u32 = 2;
const FLAG_FREE_TILE: u32 = 6;

const HEADER_SIZE: u64 = 108;
const TILE_RECORD_SIZE: u64 = 36;

/// Morton key over the low 21 bits of each tile coordinate
fn z_order(x: i32, y: i32, z: i32) -> i64 {
    let mut value: i64 = 0;
    for i in (0..=20).rev() {
        for src in [x, y, z] {
            if src & (1 << i) != 0 {
                value |= 1;
            }
            value <<= 1;
        }
    }
    value
}

struct TileEntry {
    x: i32,
    y: i32,
    z: i32,
    offset: u64,
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], pos: usize) -> Option<u64> {
    data.get(pos..pos + 8).map(|b| {
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

fn read_i32(data: &[u8], pos: usize) -> Option<i32> {
    read_u32(data, pos).map(|v| v as i32)
}

fn description_bytes(format: PixelFormat, tile_w: i32, tile_h: i32, bpp: usize, extent: &Rect) -> [u8; 64] {
    let mut text = Vec::new();
    text.extend_from_slice(format.name().as_bytes());
    text.push(0);
    text.extend_from_slice(
        format!(
            "\n{}×{} {}bpp\n{}x{}\n\n\n\n\n\n\n\n\n",
            tile_w, tile_h, bpp, extent.width, extent.height
        )
        .as_bytes(),
    );
    let mut out = [0u8; 64];
    let n = text.len().min(64);
    out[..n].copy_from_slice(&text[..n]);
    out
}

impl Buffer {
    /// Saves `rect` (or the full extent) of the buffer to `path`
    pub fn save(&self, path: impl AsRef<Path>, rect: Option<&Rect>) -> Result<()> {
        let extent = self.extent();
        let roi = rect.copied().unwrap_or(extent);
        let storage = self.storage();
        let tile_width = storage.tile_width;
        let tile_height = storage.tile_height;
        let bpp = storage.format.bytes_per_pixel();
        let tile_size = storage.tile_size;

        // collect the level-0 tiles with data under the rect
        let mut entries: Vec<TileEntry> = Vec::new();
        let shift_x = self.shift_x();
        let shift_y = self.shift_y();
        let ty0 = tile_index(roi.y + shift_y, tile_height);
        let ty1 = tile_index(roi.y + shift_y + roi.height - 1, tile_height);
        let tx0 = tile_index(roi.x + shift_x, tile_width);
        let tx1 = tile_index(roi.x + shift_x + roi.width - 1, tile_width);
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                if storage.exist(tx, ty, 0) {
                    entries.push(TileEntry {
                        x: tx,
                        y: ty,
                        z: 0,
                        offset: 0,
                    });
                }
            }
        }

        entries.sort_by_key(|e| std::cmp::Reverse(z_order(e.x, e.y, e.z)));

        // lay the payloads out right after the index
        let mut offset = HEADER_SIZE + TILE_RECORD_SIZE * entries.len() as u64;
        for entry in entries.iter_mut() {
            entry.offset = offset;
            offset += tile_size as u64;
        }

        let mut out = Vec::with_capacity(offset as usize);

        // header
        out.extend_from_slice(&MAGIC);
        push_u32(&mut out, FLAG_HEADER);
        push_u64(&mut out, HEADER_SIZE);
        push_u32(&mut out, tile_width as u32);
        push_u32(&mut out, tile_height as u32);
        push_u32(&mut out, bpp as u32);
        push_u32(&mut out, roi.width as u32);
        push_u32(&mut out, roi.height as u32);
        push_u32(&mut out, roi.x as u32);
        push_u32(&mut out, roi.y as u32);
        out.extend_from_slice(&description_bytes(
            storage.format,
            tile_width,
            tile_height,
            bpp,
            &roi,
        ));
        debug_assert_eq!(out.len() as u64, HEADER_SIZE);

        // index chain
        for (i, entry) in entries.iter().enumerate() {
            push_u32(&mut out, TILE_RECORD_SIZE as u32);
            let next = if i + 1 < entries.len() {
                HEADER_SIZE + TILE_RECORD_SIZE * (i as u64 + 1)
            } else {
                0
            };
            push_u64(&mut out, next);
            push_u32(&mut out, FLAG_TILE);
            push_i32(&mut out, entry.x);
            push_i32(&mut out, entry.y);
            push_i32(&mut out, entry.z);
            push_u64(&mut out, entry.offset);
        }

        // payloads
        for entry in entries.iter() {
            debug_assert_eq!(out.len() as u64, entry.offset);
            match storage.get_tile(entry.x, entry.y, entry.z) {
                Some(tile) => {
                    tile.read_lock();
                    out.extend_from_slice(tile.data());
                    tile.read_unlock();
                }
                None => {
                    // the offsets are already laid out; pad to keep them
                    log::warn!(
                        "{}, writing zeros",
                        Error::TileFetchMiss(entry.x, entry.y, entry.z)
                    );
                    out.resize(out.len() + tile_size, 0);
                }
            }
        }

        let mut file = File::create(path)?;
        file.write_all(&out)?;
        Ok(())
    }

    /// Loads a buffer saved by [`Buffer::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Buffer>> {
        let file = File::open(path.as_ref())?;
        let map = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &map;

        if data.len() < HEADER_SIZE as usize {
            return Err(Error::InvalidFormat("file shorter than header".into()));
        }
        if data[..4] != MAGIC {
            let mut magic = [0u8; 4];
            magic.copy_from_slice(&data[..4]);
            return Err(Error::InvalidMagic(magic));
        }

        let next = read_u64(data, 8).unwrap();
        let tile_width = read_u32(data, 16).unwrap() as i32;
        let tile_height = read_u32(data, 20).unwrap() as i32;
        let bpp = read_u32(data, 24).unwrap() as usize;
        let width = read_u32(data, 28).unwrap() as i32;
        let height = read_u32(data, 32).unwrap() as i32;
        let x = read_u32(data, 36).unwrap() as i32;
        let y = read_u32(data, 40).unwrap() as i32;

        let description = &data[44..108];
        let name_end = description.iter().position(|&b| b == 0).unwrap_or(64);
        let format = std::str::from_utf8(&description[..name_end])
            .ok()
            .and_then(PixelFormat::from_name)
            .ok_or_else(|| Error::InvalidFormat("unknown pixel format in header".into()))?;

        if format.bytes_per_pixel() != bpp {
            return Err(Error::FormatMismatch(format!(
                "header says {} bpp but format {} has {}",
                bpp,
                format.name(),
                format.bytes_per_pixel()
            )));
        }

        let buffer = Buffer::with_tile_size(
            Rect::new(x, y, width, height),
            format,
            tile_width,
            tile_height,
        );
        buffer.mark_initialized();
        let tile_size = tile_width as usize * tile_height as usize * bpp;

        // walk the index chain
        let mut entries = Vec::new();
        let mut offset = next;
        while offset != 0 {
            let pos = offset as usize;
            let (Some(length), Some(next), Some(flags)) = (
                read_u32(data, pos),
                read_u64(data, pos + 4),
                read_u32(data, pos + 12),
            ) else {
                log::warn!("buffer index truncated at offset {}", offset);
                break;
            };

            match flags {
                FLAG_TILE | FLAG_FREE_TILE => {
                    let (Some(tx), Some(ty), Some(tz), Some(payload)) = (
                        read_i32(data, pos + 16),
                        read_i32(data, pos + 20),
                        read_i32(data, pos + 24),
                        read_u64(data, pos + 28),
                    ) else {
                        log::warn!("tile record truncated at offset {}", offset);
                        break;
                    };
                    // freed blocks are chain links only, never pixel data
                    if flags == FLAG_TILE {
                        entries.push(TileEntry {
                            x: tx,
                            y: ty,
                            z: tz,
                            offset: payload,
                        });
                    }
                }
                other => {
                    log::warn!("skipping unknown block kind {} (length {})", other, length);
                }
            }
            offset = next;
        }

        // read the payloads
        let storage = buffer.storage();
        for entry in entries {
            let start = entry.offset as usize;
            let Some(payload) = data.get(start..start + tile_size) else {
                log::warn!(
                    "tile ({}, {}, {}) payload truncated",
                    entry.x,
                    entry.y,
                    entry.z
                );
                continue;
            };
            let Some(tile) = storage.get_tile_discard(entry.x, entry.y, entry.z) else {
                log::warn!(
                    "{}, skipping stored tile",
                    Error::TileFetchMiss(entry.x, entry.y, entry.z)
                );
                continue;
            };
            tile.lock();
            tile.data_mut().copy_from_slice(payload);
            tile.unlock();
        }

        Ok(buffer)
    }

    /// Opens `path` as a buffer, creating an empty float buffer when the
    /// file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Buffer>> {
        if path.as_ref().exists() {
            Buffer::load(path)
        } else {
            Ok(Buffer::new(Rect::default(), PixelFormat::RGBA_F32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AbyssPolicy, SampleFilter};

    fn gradient(width: i32, height: i32, tile: i32) -> Arc<Buffer> {
        let buffer = Buffer::with_tile_size(
            Rect::new(0, 0, width, height),
            PixelFormat::RGBA_U8,
            tile,
            tile,
        );
        let mut data = vec![0u8; (width * height * 4) as usize];
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 4) as usize;
                data[i] = x as u8;
                data[i + 1] = y as u8;
                data[i + 2] = (x.wrapping_mul(y)) as u8;
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
    fn test_z_order_interleaves() {
        assert_eq!(z_order(0, 0, 0), 0);
        assert!(z_order(1, 0, 0) > z_order(0, 0, 0));
        // y contributes a lower bit than x at the same magnitude
        assert!(z_order(1, 0, 0) > z_order(0, 1, 0));
        assert!(z_order(0, 1, 0) > z_order(0, 0, 1));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.rtb");

        let buffer = gradient(200, 200, 64);
        buffer.save(&path, None).unwrap();

        let loaded = Buffer::load(&path).unwrap();
        assert_eq!(loaded.extent(), Rect::new(0, 0, 200, 200));
        assert_eq!(loaded.format(), PixelFormat::RGBA_U8);
        assert_eq!(loaded.tile_width(), 64);

        let mut expected = vec![0u8; 200 * 200 * 4];
        let mut actual = vec![0u8; 200 * 200 * 4];
        let roi = Rect::new(0, 0, 200, 200);
        buffer.get(&roi, 1.0, None, &mut expected, 200 * 4, AbyssPolicy::None, SampleFilter::Auto);
        loaded.get(&roi, 1.0, None, &mut actual, 200 * 4, AbyssPolicy::None, SampleFilter::Auto);
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_header_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.rtb");
        let buffer = gradient(64, 32, 32);
        buffer.save(&path, None).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"GEGL");
        assert_eq!(read_u32(&bytes, 4).unwrap(), FLAG_HEADER);
        assert_eq!(read_u64(&bytes, 8).unwrap(), HEADER_SIZE);
        assert_eq!(read_u32(&bytes, 16).unwrap(), 32); // tile width
        assert_eq!(read_u32(&bytes, 20).unwrap(), 32); // tile height
        assert_eq!(read_u32(&bytes, 24).unwrap(), 4); // bpp
        assert_eq!(read_u32(&bytes, 28).unwrap(), 64); // width
        assert_eq!(read_u32(&bytes, 32).unwrap(), 32); // height
        // description starts with the format name
        assert!(bytes[44..].starts_with(b"RGBA u8\0"));
    }

    #[test]
    fn test_index_chain_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.rtb");
        let buffer = gradient(64, 64, 32); // four tiles
        buffer.save(&path, None).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut offset = read_u64(&bytes, 8).unwrap();
        let mut records = 0;
        while offset != 0 {
            let pos = offset as usize;
            assert_eq!(read_u32(&bytes, pos).unwrap(), TILE_RECORD_SIZE as u32);
            assert_eq!(read_u32(&bytes, pos + 12).unwrap(), FLAG_TILE);
            offset = read_u64(&bytes, pos + 4).unwrap();
            records += 1;
            assert!(records <= 4);
        }
        assert_eq!(records, 4);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rtb");
        let mut bytes = vec![0u8; 200];
        bytes[..4].copy_from_slice(b"NOPE");
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(Buffer::load(&path), Err(Error::InvalidMagic(_))));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.rtb");
        std::fs::write(&path, b"GEGL").unwrap();
        assert!(Buffer::load(&path).is_err());
    }

    #[test]
    fn test_unknown_blocks_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.rtb");
        let buffer = gradient(32, 32, 32);
        buffer.save(&path, None).unwrap();

        // rewrite the single tile record's flags to an unknown kind; the
        // loader must survive and simply produce an empty buffer
        let mut bytes = std::fs::read(&path).unwrap();
        let pos = HEADER_SIZE as usize;
        bytes[pos + 12..pos + 16].copy_from_slice(&99u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let loaded = Buffer::load(&path).unwrap();
        let mut px = [1u8; 4];
        loaded.get(
            &Rect::new(5, 5, 1, 1),
            1.0,
            None,
            &mut px,
            4,
            AbyssPolicy::None,
            SampleFilter::Auto,
        );
        assert_eq!(px, [0, 0, 0, 0]);
    }

    #[test]
    fn test_open_missing_creates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.rtb");
        let buffer = Buffer::open(&path).unwrap();
        assert_eq!(buffer.format(), PixelFormat::RGBA_F32);
        assert!(buffer.extent().is_empty());
    }

    #[test]
    fn test_save_subrect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub.rtb");
        let buffer = gradient(128, 128, 32);
        buffer.save(&path, Some(&Rect::new(0, 0, 64, 64))).unwrap();

        let loaded = Buffer::load(&path).unwrap();
        assert_eq!(loaded.extent(), Rect::new(0, 0, 64, 64));

        let mut px = [0u8; 4];
        loaded.get(
            &Rect::new(40, 40, 1, 1),
            1.0,
            None,
            &mut px,
            4,
            AbyssPolicy::None,
            SampleFilter::Auto,
        );
        assert_eq!(px, [40, 40, (40u8).wrapping_mul(40), 255]);
    }
}
