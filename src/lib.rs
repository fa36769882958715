//! rastertile - a tiled pixel-buffer storage engine for Rust
//!
//! rastertile presents an apparently unbounded two-dimensional raster of
//! pixels in a pluggable numeric format while physically storing it as
//! fixed-size tiles with copy-on-write sharing, an in-memory cache, lazily
//! synthesized mipmap levels, configurable out-of-bounds ("abyss")
//! behavior, several resampling filters, lossless tile codecs, and a
//! simple on-disk format.
//!
//! # Examples
//!
//! ## Basic usage
//!
//! ```
//! use rastertile::{Buffer, Rect, PixelFormat, AbyssPolicy, SampleFilter};
//!
//! let buffer = Buffer::new(Rect::new(0, 0, 256, 256), PixelFormat::RGBA_U8);
//!
//! // write a rectangle of pixels
//! let red = [255u8, 0, 0, 255].repeat(16 * 16);
//! buffer.set(&Rect::new(10, 10, 16, 16), 0, PixelFormat::RGBA_U8, &red, 16 * 4);
//!
//! // read it back, with transparent black outside the buffer
//! let mut out = vec![0u8; 4];
//! buffer.get(
//!     &Rect::new(12, 12, 1, 1),
//!     1.0,
//!     None,
//!     &mut out,
//!     4,
//!     AbyssPolicy::None,
//!     SampleFilter::Auto,
//! );
//! assert_eq!(out, [255, 0, 0, 255]);
//! ```
//!
//! ## Cheap snapshots
//!
//! Duplicating a buffer shares tile bytes until one side writes:
//!
//! ```
//! use rastertile::{Buffer, Rect, PixelFormat};
//!
//! let buffer = Buffer::new(Rect::new(0, 0, 512, 512), PixelFormat::RGBA_U8);
//! buffer.set_color_from_pixel(None, &[0, 128, 0, 255], PixelFormat::RGBA_U8);
//! let snapshot = buffer.dup();
//! // mutating `buffer` from here on never disturbs `snapshot`
//! ```

pub mod buffer;
pub mod compression;
pub mod error;
pub mod format;
pub mod ops;
pub mod rect;
pub mod sampler;
pub mod scratch;
pub mod tile;

pub use buffer::iterator::{Access, BufferIterator};
pub use buffer::{AbyssPolicy, Buffer, SampleFilter, SetFlags};
pub use compression::{codec, codec_list, Codec};
pub use error::{Error, Result};
pub use format::{convert_pixels, convert_rows, ColorModel, ComponentType, PixelFormat};
pub use rect::{Alignment, Rect};
pub use sampler::{Matrix2, Sampler, SamplerKind};
pub use tile::backend::{RamBackend, TileBackend};
pub use tile::storage::{TileCommand, TileHandler, TileReply, TileStorage};
pub use tile::Tile;
