//! Block-list pseudo-filesystem: `offset+length[,offset+length...]` in
//! sectors, addressing raw device ranges without a filesystem.
//!
//! An omitted offset continues right after the previous block; an omitted
//! length runs to the end of the device.  Numbers are decimal or `0x` hex.

use crate::disk::{Disk, SECTOR_SIZE};
use crate::error::{Result, VfsError};
use crate::file::{File, FileSource};

/// One sector range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub length: u64,
}

/// Parse a block-list against a device of `total_sectors` sectors.
pub fn parse(spec: &str, total_sectors: Option<u64>) -> Result<Vec<Block>> {
    let bad = || VfsError::BadFilename(spec.to_string());

    let mut blocks = Vec::new();
    let mut next = 0u64;
    for part in spec.split(',') {
        let (off, len) = part.split_once('+').ok_or_else(bad)?;

        let offset = if off.is_empty() { next } else { parse_number(off).ok_or_else(bad)? };

        let len = len.trim_end();
        let length = if len.is_empty() {
            total_sectors
                .and_then(|total| total.checked_sub(offset))
                .ok_or_else(bad)?
        } else {
            parse_number(len).ok_or_else(bad)?
        };
        if length == 0 {
            return Err(bad());
        }

        let end = offset.checked_add(length).ok_or_else(bad)?;
        if total_sectors.is_some_and(|total| end > total) {
            return Err(bad());
        }
        next = end;
        blocks.push(Block { offset, length });
    }
    Ok(blocks)
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
            u64::from_str_radix(hex, 16).ok()
        }
        Some(_) => None,
        None if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
        None => None,
    }
}

/// Open `spec` on `disk`.  The file size is the sum of the block lengths.
pub fn open(disk: Disk, spec: &str) -> Result<File> {
    let blocks = parse(spec, disk.total_sectors())?;
    let size = blocks
        .iter()
        .try_fold(0u64, |acc, b| {
            b.length.checked_mul(SECTOR_SIZE).and_then(|bytes| acc.checked_add(bytes))
        })
        .ok_or_else(|| VfsError::BadFilename(spec.to_string()))?;
    Ok(File::new(Box::new(BlocklistSource { disk, blocks }), Some(size)))
}

struct BlocklistSource {
    disk:   Disk,
    blocks: Vec<Block>,
}

impl FileSource for BlocklistSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        let mut skip = offset;
        for block in &self.blocks {
            if done == buf.len() {
                break;
            }
            let bytes = block.length * SECTOR_SIZE;
            if skip >= bytes {
                skip -= bytes;
                continue;
            }
            let n = usize::try_from(bytes - skip)
                .unwrap_or(usize::MAX)
                .min(buf.len() - done);
            self.disk.read(block.offset, skip, &mut buf[done..done + n])?;
            done += n;
            skip = 0;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(offset: u64, length: u64) -> Block {
        Block { offset, length }
    }

    #[test]
    fn parses_explicit_ranges() {
        assert_eq!(parse("0+4,10+2", Some(16)).unwrap(), vec![b(0, 4), b(10, 2)]);
        assert_eq!(parse("0x10+0x2", Some(32)).unwrap(), vec![b(16, 2)]);
    }

    #[test]
    fn omitted_fields_use_defaults() {
        assert_eq!(parse("2+3,+4", Some(16)).unwrap(), vec![b(2, 3), b(5, 4)]);
        assert_eq!(parse("6+", Some(16)).unwrap(), vec![b(6, 10)]);
        assert_eq!(parse("+2", None).unwrap(), vec![b(0, 2)]);
        assert!(parse("6+", None).is_err());
    }

    #[test]
    fn rejects_malformed_lists() {
        for spec in ["", "abc", "1+2x", "1+0", "4", "0+17", "1+2,", "0x+1", "-1+2"] {
            assert!(
                matches!(parse(spec, Some(16)), Err(VfsError::BadFilename(_))),
                "{spec:?} should be rejected"
            );
        }
    }

    #[test]
    fn trailing_whitespace_is_allowed() {
        assert_eq!(parse("1+2 ", Some(4)).unwrap(), vec![b(1, 2)]);
    }
}
