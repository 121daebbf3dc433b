//! Archive codec: conversion between a directory tree and a single
//! compressed container.
//!
//! Container layout:
//!
//! | Offset | Size | Content                                   |
//! |--------|------|-------------------------------------------|
//! | 0      | 4    | magic bytes `WCBK`                        |
//! | 4      | 1    | format version (`1`)                      |
//! | 5      | ..   | one zstd frame wrapping a tar stream      |

pub mod codec;

use std::path::Path;

use crate::utils::Result;

pub use codec::ZstdTarCodec;

pub const MAGIC: &[u8; 4] = b"WCBK";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = MAGIC.len() + 1;

/// Compression level used when none is configured
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Output of [`ArchiveCodec::pack`]
#[derive(Debug, Clone)]
pub struct PackedArchive {
    pub bytes: Vec<u8>,
    /// Number of regular files in the container
    pub file_count: usize,
    /// Uncompressed size of all regular files
    pub content_bytes: u64,
}

/// Summary of an [`ArchiveCodec::unpack`] run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    pub files_written: usize,
    pub dirs_created: usize,
    pub bytes_written: u64,
}

/// Serializes a directory tree into a container and back.
///
/// Both operations are blocking; the engine runs them on the blocking pool.
pub trait ArchiveCodec: Send + Sync {
    /// Pack every file and directory under `source` into a container.
    fn pack(&self, source: &Path) -> Result<PackedArchive>;

    /// Recreate the container's tree under `destination`, overwriting
    /// existing files. Files written before a failure are left in place.
    fn unpack(&self, bytes: &[u8], destination: &Path) -> Result<UnpackSummary>;
}
