//! Error types for the rANS codec.

use thiserror::Error;

/// Error variants for encode/decode operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Input length is not a positive multiple of the block size, or a block
    /// in the container claims a decoded size other than one full block.
    #[error("input is not a positive multiple of {0}-byte blocks")]
    PartialBlock(usize),

    /// The destination buffer cannot hold the result.
    #[error("destination too small: need {need} bytes, have {have}")]
    DstCapacityTooSmall { need: usize, have: usize },

    /// Probability resolution outside the supported range.
    #[error("prob bits must be >= 9 && <= 11, got {0}")]
    UnsupportedProbBits(u32),

    /// The container does not start with the expected magic number.
    #[error("bad magic: expected 0x{expected:04x}, got 0x{got:04x}")]
    BadMagic { expected: u32, got: u32 },

    /// The container was produced by an incompatible format version.
    #[error("bad version: expected 0x{expected:04x}, got 0x{got:04x}")]
    BadVersion { expected: u32, got: u32 },

    /// The input ends before the ranges declared in its header.
    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// A header-declared range or table is internally inconsistent.
    #[error("corrupted container: {0}")]
    Corrupted(&'static str),

    /// An I/O error occurred while reading or writing a file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;
