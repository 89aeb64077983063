//! LZ4 frame decoder.
//!
//! # Frame layout (little-endian)
//! ```text
//! magic 0x184D2204 | FLG | BD | [content size u64] | [dict id u32] | HC
//! { block size u32 (bit 31 = stored) | data | [block checksum u32] } ...
//! end mark u32 0 | [content checksum u32]
//! ```
//! Checksums are skipped, not verified.  Blocks decode one at a time into a
//! window; reading before the window restarts from the first block.

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;

use super::{peek, FilterOutcome, StreamFilter};
use crate::error::{zeroed_buf, Result, VfsError};
use crate::file::{File, FileSource, FileType};

pub const LZ4_MAGIC: u32 = 0x184D_2204;

/// Largest block the frame format allows.
pub const MAX_BLOCK_SIZE: usize = 4 << 20;

/// History kept for linked blocks.
const DICT_SIZE: usize = 64 << 10;

const FLG_VERSION_MASK:    u8 = 0xC0;
const FLG_VERSION:         u8 = 0x40;
const FLG_INDEPENDENT:     u8 = 0x20;
const FLG_BLOCK_CHECKSUM:  u8 = 0x10;
const FLG_CONTENT_SIZE:    u8 = 0x08;
const FLG_RESERVED:        u8 = 0x02;
const FLG_DICT_ID:         u8 = 0x01;

const STORED_BLOCK: u32 = 0x8000_0000;

/// Parsed frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub independent:    bool,
    pub block_checksum: bool,
    pub content_size:   Option<u64>,
    pub dict_id:        Option<u32>,
    pub max_block:      usize,
    /// Bytes up to the first block.
    pub header_len:     u64,
}

impl FrameHeader {
    /// Parse `buf`, which starts with the magic.  `Ok(None)` means the
    /// magic does not match.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let truncated = || VfsError::BadFs("truncated lz4 frame header".into());
        let mut r = Cursor::new(buf);
        match r.read_u32::<LittleEndian>() {
            Ok(LZ4_MAGIC) => {}
            _ => return Ok(None),
        }
        let flg = r.read_u8().map_err(|_| truncated())?;
        let bd = r.read_u8().map_err(|_| truncated())?;

        if flg & FLG_VERSION_MASK != FLG_VERSION || flg & FLG_RESERVED != 0 || bd & 0x8F != 0 {
            return Err(VfsError::BadFs(format!("unsupported lz4 descriptor {flg:#04x}/{bd:#04x}")));
        }
        let code = u32::from((bd >> 4) & 0x07);
        if code < 4 {
            return Err(VfsError::BadFs(format!("invalid lz4 block size code {code}")));
        }
        let max_block = 1usize << (2 * code + 8);
        if max_block > MAX_BLOCK_SIZE {
            return Err(VfsError::BadFs(format!("lz4 block size {max_block} too large")));
        }

        let content_size = if flg & FLG_CONTENT_SIZE != 0 {
            Some(r.read_u64::<LittleEndian>().map_err(|_| truncated())?)
        } else {
            None
        };
        let dict_id = if flg & FLG_DICT_ID != 0 {
            Some(r.read_u32::<LittleEndian>().map_err(|_| truncated())?)
        } else {
            None
        };
        let _hc = r.read_u8().map_err(|_| truncated())?;

        Ok(Some(Self {
            independent: flg & FLG_INDEPENDENT != 0,
            block_checksum: flg & FLG_BLOCK_CHECKSUM != 0,
            content_size,
            dict_id,
            max_block,
            header_len: r.position(),
        }))
    }
}

/// Magic + FLG + BD + content size + dict id + HC.
const MAX_HEADER_LEN: usize = 4 + 1 + 1 + 8 + 4 + 1;
const MIN_HEADER_LEN: usize = 7;

pub struct Lz4Filter;

impl StreamFilter for Lz4Filter {
    fn name(&self) -> &'static str { "lz4" }

    fn try_open(&self, mut file: File, file_type: FileType) -> Result<FilterOutcome> {
        if file_type.contains(FileType::NO_DECOMPRESS) {
            return Ok(FilterOutcome::Passthrough(file));
        }
        let mut head = [0u8; MAX_HEADER_LEN];
        let got = peek(&mut file, &mut head)?;
        if got < MIN_HEADER_LEN {
            return Ok(FilterOutcome::Passthrough(file));
        }
        let header = match FrameHeader::parse(&head[..got])? {
            Some(h) => h,
            None => return Ok(FilterOutcome::Passthrough(file)),
        };
        if header.dict_id.is_some() {
            return Err(VfsError::NotImplemented("lz4 frames with an external dictionary"));
        }
        debug!("lz4 frame: {header:?}");

        let stream_start = file.offset();
        let mut source = Lz4Source {
            inner: file,
            stream_start,
            header,
            cbuf: zeroed_buf(header.max_block)?,
            block: zeroed_buf(header.max_block)?,
            history: Vec::new(),
            out_start: 0,
            block_len: 0,
            eof: false,
        };
        source.restart()?;
        Ok(FilterOutcome::Wrapped(File::new(Box::new(source), header.content_size)))
    }
}

struct Lz4Source {
    inner:        File,
    stream_start: u64,
    header:       FrameHeader,
    /// Encoded block as read from the inner file.
    cbuf:         Vec<u8>,
    /// Decoded current block.
    block:        Vec<u8>,
    /// Trailing output of previous blocks, for linked frames.
    history:      Vec<u8>,
    /// Uncompressed offset of `block[0]`.
    out_start:    u64,
    block_len:    usize,
    eof:          bool,
}

impl Lz4Source {
    fn restart(&mut self) -> Result<()> {
        self.inner.seek(self.stream_start + self.header.header_len)?;
        self.out_start = 0;
        self.block_len = 0;
        self.history.clear();
        self.eof = false;
        Ok(())
    }

    fn read_block_data(&mut self, len: usize) -> Result<()> {
        if self.inner.read_full(&mut self.cbuf[..len])? != len {
            return Err(VfsError::BadCompressedData("lz4 stream truncated in block data".into()));
        }
        Ok(())
    }

    /// Decode the next block into the window.  A missing end mark is taken
    /// as the end of the stream.
    fn next_block(&mut self) -> Result<()> {
        self.out_start += self.block_len as u64;
        self.block_len = 0;

        let mut word = [0u8; 4];
        match self.inner.read_full(&mut word)? {
            0 => {
                self.eof = true;
                return Ok(());
            }
            4 => {}
            _ => return Err(VfsError::BadCompressedData("lz4 stream truncated in block size".into())),
        }
        let raw = LittleEndian::read_u32(&word);
        if raw == 0 {
            self.eof = true;
            return Ok(());
        }

        let len = (raw & !STORED_BLOCK) as usize;
        if len > self.header.max_block {
            return Err(VfsError::BadCompressedData(format!(
                "lz4 block of {len} bytes exceeds {}", self.header.max_block
            )));
        }
        self.read_block_data(len)?;
        if self.header.block_checksum {
            let mut checksum = [0u8; 4];
            if self.inner.read_full(&mut checksum)? != checksum.len() {
                return Err(VfsError::BadCompressedData("lz4 stream truncated in block checksum".into()));
            }
        }

        let n = if raw & STORED_BLOCK != 0 {
            self.block[..len].copy_from_slice(&self.cbuf[..len]);
            len
        } else if self.header.independent {
            lz4_flex::block::decompress_into(&self.cbuf[..len], &mut self.block)
                .map_err(|e| VfsError::BadCompressedData(format!("lz4: {e}")))?
        } else {
            lz4_flex::block::decompress_into_with_dict(&self.cbuf[..len], &mut self.block, &self.history)
                .map_err(|e| VfsError::BadCompressedData(format!("lz4: {e}")))?
        };
        self.block_len = n;

        if !self.header.independent {
            self.history.extend_from_slice(&self.block[..n]);
            if self.history.len() > DICT_SIZE {
                let excess = self.history.len() - DICT_SIZE;
                self.history.drain(..excess);
            }
        }
        Ok(())
    }
}

impl FileSource for Lz4Source {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset < self.out_start {
            debug!("lz4: backward read to {offset}, restarting");
            self.restart()?;
        }
        let mut done = 0usize;
        loop {
            let pos = offset + done as u64;
            let end = self.out_start + self.block_len as u64;
            if pos >= self.out_start && pos < end {
                let from = (pos - self.out_start) as usize;
                let n = (self.block_len - from).min(buf.len() - done);
                buf[done..done + n].copy_from_slice(&self.block[from..from + n]);
                done += n;
            }
            if done == buf.len() || self.eof {
                return Ok(done);
            }
            self.next_block()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOutcome;
    use lz4_flex::frame::{BlockMode, BlockSize, FrameEncoder, FrameInfo};
    use std::io::Write;

    struct Bytes(Vec<u8>);

    impl FileSource for Bytes {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let start = (offset as usize).min(self.0.len());
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }
    }

    fn file(data: Vec<u8>) -> File {
        let len = data.len() as u64;
        File::new(Box::new(Bytes(data)), Some(len))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i / 3) ^ (i >> 9)) as u8).collect()
    }

    fn frame(data: &[u8], info: FrameInfo) -> Vec<u8> {
        let mut enc = FrameEncoder::with_frame_info(info, Vec::new());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn open(data: Vec<u8>) -> File {
        match Lz4Filter.try_open(file(data), FileType::NONE).unwrap() {
            FilterOutcome::Wrapped(f) => f,
            FilterOutcome::Passthrough(_) => panic!("lz4 frame not recognised"),
        }
    }

    #[test]
    fn parses_descriptor_fields() {
        // FLG: version 01, independent, content size; BD: 64 KiB.
        let mut h = LZ4_MAGIC.to_le_bytes().to_vec();
        h.extend_from_slice(&[0x68, 0x40]);
        h.extend_from_slice(&1234u64.to_le_bytes());
        h.push(0);
        let hdr = FrameHeader::parse(&h).unwrap().unwrap();
        assert!(hdr.independent);
        assert_eq!(hdr.content_size, Some(1234));
        assert_eq!(hdr.max_block, 64 << 10);
        assert_eq!(hdr.header_len, 15);

        assert_eq!(FrameHeader::parse(b"not lz4 at all").unwrap(), None);
        h[5] = 0x30;
        assert!(matches!(FrameHeader::parse(&h), Err(VfsError::BadFs(_))));
    }

    #[test]
    fn independent_blocks_with_content_size() {
        let data = payload(300_000);
        let info = FrameInfo::new()
            .block_size(BlockSize::Max64KB)
            .block_mode(BlockMode::Independent)
            .content_size(Some(data.len() as u64));
        let mut f = open(frame(&data, info));
        assert_eq!(f.size(), Some(data.len() as u64));
        let mut out = vec![0u8; data.len()];
        assert_eq!(f.read_full(&mut out).unwrap(), data.len());
        assert!(out == data);
    }

    #[test]
    fn linked_blocks_without_content_size() {
        let data = payload(200_000);
        let info = FrameInfo::new()
            .block_size(BlockSize::Max64KB)
            .block_mode(BlockMode::Linked)
            .block_checksums(true);
        let mut f = open(frame(&data, info));
        assert_eq!(f.size(), None);
        let mut out = Vec::new();
        let mut chunk = [0u8; 7777];
        loop {
            let n = f.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert!(out == data);
    }

    #[test]
    fn checksummed_blocks_in_both_modes() {
        let data = payload(200_000);
        for mode in [BlockMode::Independent, BlockMode::Linked] {
            let info = FrameInfo::new()
                .block_size(BlockSize::Max64KB)
                .block_mode(mode)
                .block_checksums(true)
                .content_checksum(true)
                .content_size(Some(data.len() as u64));
            let mut f = open(frame(&data, info));
            let mut out = vec![0u8; data.len()];
            assert_eq!(f.read_full(&mut out).unwrap(), data.len());
            assert!(out == data, "{mode:?}");
        }
    }

    #[test]
    fn truncated_block_checksum() {
        let data = payload(1000);
        let info = FrameInfo::new().block_mode(BlockMode::Independent).block_checksums(true);
        let mut packed = frame(&data, info);
        // Drop the end mark and half of the block checksum.
        packed.truncate(packed.len() - 6);
        let mut f = open(packed);
        let mut buf = vec![0u8; data.len()];
        assert!(matches!(f.read_full(&mut buf), Err(VfsError::BadCompressedData(_))));
    }

    #[test]
    fn backward_read_restarts() {
        let data = payload(150_000);
        let info = FrameInfo::new().block_size(BlockSize::Max64KB);
        let mut f = open(frame(&data, info));
        let mut buf = vec![0u8; 1000];
        f.seek(140_000).unwrap();
        f.read_full(&mut buf).unwrap();
        assert!(buf[..] == data[140_000..141_000]);
        f.seek(10).unwrap();
        f.read_full(&mut buf).unwrap();
        assert!(buf[..] == data[10..1010]);
    }

    #[test]
    fn corrupt_block_is_bad_compressed_data() {
        let data = payload(50_000);
        let mut packed = frame(&data, FrameInfo::new().content_size(Some(50_000)));
        // Claim a block larger than the descriptor allows.
        let at = 15;
        packed[at..at + 4].copy_from_slice(&0x7FFF_FFFFu32.to_le_bytes());
        let mut f = open(packed);
        let mut buf = [0u8; 16];
        assert!(matches!(f.read(&mut buf), Err(VfsError::BadCompressedData(_))));
    }

    #[test]
    fn plain_data_passes_through() {
        match Lz4Filter.try_open(file(b"plain text file".to_vec()), FileType::NONE).unwrap() {
            FilterOutcome::Passthrough(f) => assert_eq!(f.offset(), 0),
            FilterOutcome::Wrapped(_) => panic!("plain data wrapped"),
        }
    }
}
