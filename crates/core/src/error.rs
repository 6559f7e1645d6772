//! Errors surfaced by the core.
//!
//! Hardware protocol violations are never errors; the peripherals recover
//! locally just like the real chips do. Only configuration problems reach
//! the caller: malformed save states and out-of-range cartridge images.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{tag} block is {actual} bytes, expected {expected}")]
    BlockSize {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("save state is missing the {0} block")]
    MissingBlock(&'static str),

    #[error("invalid save state file (bad magic)")]
    BadMagic,

    #[error("unsupported save state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("save state file too small")]
    Truncated,

    #[error("decompress error: {0}")]
    Decompress(String),

    #[error("serialize error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported tile map geometry {width}x{height}")]
    MapGeometry { width: u8, height: u8 },

    #[error("cartridge image of {0} bytes is out of range")]
    RomSize(usize),

    #[error("invalid color info: {0}")]
    ColorInfo(&'static str),
}
