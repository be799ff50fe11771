//! Cache error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing a cache file.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O failure on a cache file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A block header did not start with the block magic.
    #[error("Wrong block magic {found:#x}")]
    WrongBlockMagic { found: u32 },

    /// The input ended inside a block header.
    #[error("Couldn't read block header")]
    TruncatedHeader,

    /// The input ended inside a block payload.
    #[error("Incomplete block: expected {expected} bytes, {available} available")]
    IncompleteBlock { expected: u32, available: u64 },

    /// A block payload did not match its checksum.
    #[error("Wrong block checksum: expected {expected:#018x}, got {actual:#018x}")]
    WrongChecksum { expected: u64, actual: u64 },

    /// The file was written by an incompatible format version.
    #[error("Cache version mismatch: expected {expected:#x}, found {found:#x}")]
    VersionMismatch { expected: u64, found: u64 },

    /// The stored entry count cannot fit in the remaining bytes.
    #[error("Corrupt entry count {count} with {remaining} bytes remaining")]
    CorruptEntryCount { count: u64, remaining: u64 },

    /// An entry could not be encoded.
    #[error("Failed to encode cache entry: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// An entry could not be decoded.
    #[error("Failed to decode cache entry: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl CacheError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error indicates damaged cache contents rather than an I/O failure.
    pub fn is_integrity_failure(&self) -> bool {
        !matches!(self, Self::Io { .. } | Self::Encode(_))
    }
}
