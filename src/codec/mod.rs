//! ZFS-embedded Zstandard blocks.
//!
//! ZFS stores each zstd-compressed record behind its own 8-byte header
//! instead of relying on the frame's content size.  This module is a
//! single-shot, whole-buffer codec for that layout; it is not a stream
//! filter.
//!
//! # Header (big-endian)
//! ```text
//! u32 c_len                       compressed payload length
//! u32 version:24 | level:8        level is the top byte
//! ```
//! The level byte is a dataset-internal code, not a zstd level: codes 1-19
//! are the positive levels, codes from 103 up are the negative "fast"
//! levels.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, VfsError};

pub const ZFS_ZSTD_HEADER_LEN: usize = 8;

// ── Level codes ──────────────────────────────────────────────────────────────
//
// These mirror the on-disk enumeration and are permanent.  Codes 20..=102
// are reserved; 0 means "inherit" and never appears in a written block.

const CODE_LEVEL_MAX: u8 = 19;
const CODE_FAST_1:    u8 = 103;
const CODE_FAST_10:   u8 = 112;
const CODE_FAST_20:   u8 = 113;
const CODE_FAST_100:  u8 = 121;
const CODE_FAST_500:  u8 = 122;
const CODE_FAST_1000: u8 = 123;

/// Map an on-disk level code to the zstd level it stands for.
pub fn level_from_code(code: u8) -> Option<i32> {
    match code {
        1..=CODE_LEVEL_MAX => Some(i32::from(code)),
        CODE_FAST_1..=CODE_FAST_10 => Some(-i32::from(code - CODE_FAST_1 + 1)),
        CODE_FAST_20..=CODE_FAST_100 => Some(-10 * i32::from(code - CODE_FAST_20 + 2)),
        CODE_FAST_500 => Some(-500),
        CODE_FAST_1000 => Some(-1000),
        _ => None,
    }
}

/// Inverse of [`level_from_code`].
pub fn code_from_level(level: i32) -> Option<u8> {
    match level {
        1..=19 => Some(level as u8),
        -10..=-1 => Some(CODE_FAST_1 + (-level - 1) as u8),
        -100..=-20 if level % 10 == 0 => Some(CODE_FAST_20 + (-level / 10 - 2) as u8),
        -500 => Some(CODE_FAST_500),
        -1000 => Some(CODE_FAST_1000),
        _ => None,
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZfsZstdHeader {
    pub c_len:      u32,
    /// zstd library version that wrote the block, e.g. 10405 for 1.4.5.
    pub version:    u32,
    pub level_code: u8,
}

impl ZfsZstdHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.c_len)?;
        writer.write_u32::<BigEndian>((u32::from(self.level_code) << 24) | (self.version & 0x00FF_FFFF))
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let c_len = reader.read_u32::<BigEndian>()?;
        let raw = reader.read_u32::<BigEndian>()?;
        Ok(Self { c_len, version: raw & 0x00FF_FFFF, level_code: (raw >> 24) as u8 })
    }

    /// The zstd level, if the code is a known one.
    pub fn level(&self) -> Option<i32> {
        level_from_code(self.level_code)
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Decompress one ZFS zstd block into at most `d_len` bytes.
///
/// An unknown level code, a payload running past `src`, or any codec error
/// is reported as [`VfsError::BadFs`].
pub fn zfs_zstd_decompress(src: &[u8], d_len: usize) -> Result<Vec<u8>> {
    let header = ZfsZstdHeader::read(src)
        .map_err(|_| VfsError::BadFs("zstd block shorter than its header".into()))?;
    if header.level().is_none() {
        return Err(VfsError::BadFs(format!("invalid zstd level code {}", header.level_code)));
    }
    let end = ZFS_ZSTD_HEADER_LEN + header.c_len as usize;
    if end > src.len() {
        return Err(VfsError::BadFs(format!(
            "zstd block claims {} bytes, only {} present",
            header.c_len,
            src.len() - ZFS_ZSTD_HEADER_LEN
        )));
    }
    zstd::bulk::decompress(&src[ZFS_ZSTD_HEADER_LEN..end], d_len)
        .map_err(|e| VfsError::BadFs(format!("zstd block: {e}")))
}

/// Compress `data` into a ZFS zstd block at `level`, stamping `version`.
pub fn zfs_zstd_compress(data: &[u8], level: i32, version: u32) -> Result<Vec<u8>> {
    let level_code = code_from_level(level)
        .ok_or_else(|| VfsError::Config(format!("zstd level {level} has no on-disk code")))?;
    let payload = zstd::bulk::compress(data, level)
        .map_err(|e| VfsError::BadCompressedData(format!("zstd block: {e}")))?;
    let c_len = u32::try_from(payload.len())
        .map_err(|_| VfsError::OutOfRange("zstd block too large".into()))?;

    let mut out = Vec::with_capacity(ZFS_ZSTD_HEADER_LEN + payload.len());
    ZfsZstdHeader { c_len, version, level_code }.write(&mut out)?;
    out.extend_from_slice(&payload);
    Ok(out)
}
