//! Error types for rastertile

use std::fmt;
use std::io;

/// Result type for rastertile operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in rastertile operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Invalid buffer file format
    InvalidFormat(String),

    /// Invalid buffer file magic number
    InvalidMagic([u8; 4]),

    /// Pixel format mismatch (e.g. differing bytes per pixel)
    FormatMismatch(String),

    /// A tile could not be fetched from the handler chain
    TileFetchMiss(i32, i32, i32),

    /// Compressed output did not fit the destination buffer
    CompressionSizeExceeded,

    /// Unknown compression codec name
    UnknownCodec(String),

    /// Unsupported feature
    Unsupported(String),

    /// Out of bounds access
    OutOfBounds(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            Error::InvalidMagic(magic) => write!(
                f,
                "Invalid magic bytes: {:02X} {:02X} {:02X} {:02X}",
                magic[0], magic[1], magic[2], magic[3]
            ),
            Error::FormatMismatch(msg) => write!(f, "Format mismatch: {}", msg),
            Error::TileFetchMiss(x, y, z) => {
                write!(f, "No tile at ({}, {}, {})", x, y, z)
            }
            Error::CompressionSizeExceeded => {
                write!(f, "Compressed data exceeds destination buffer")
            }
            Error::UnknownCodec(name) => write!(f, "Unknown codec: {}", name),
            Error::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            Error::OutOfBounds(msg) => write!(f, "Out of bounds: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}
