//! Zstandard frame decoder.
//!
//! The frame header is checked with libzstd's own header parser for the
//! declared content size and dictionary id; the payload is then fed, header
//! included, through a streaming decompression context.  Input and output
//! windows are 128 KiB each.  Reading before the output window
//! re-initialises the context and decodes again from the start of the frame.

use ::zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};
use ::zstd::zstd_safe;
use log::debug;

use super::{peek, FilterOutcome, StreamFilter};
use crate::error::{zeroed_buf, Result, VfsError};
use crate::file::{File, FileSource, FileType};

pub const ZSTD_MAGIC: u32 = 0xFD2F_B528;

/// Size of each of the input and output windows.
pub const WINDOW_SIZE: usize = 128 << 10;

/// Magic + descriptor + window + dict id + content size.
const MAX_HEADER_LEN: usize = 4 + 1 + 1 + 4 + 8;
const MIN_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub content_size: Option<u64>,
    pub dict_id:      Option<u32>,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`.  `Ok(None)` means the magic
    /// does not match.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        if buf.get(..4) != Some(&ZSTD_MAGIC.to_le_bytes()[..]) {
            return Ok(None);
        }
        let content_size = zstd_safe::get_frame_content_size(buf)
            .map_err(|e| VfsError::BadFs(format!("zstd frame header: {e}")))?;
        let dict_id = zstd_safe::get_dict_id_from_frame(buf).map(|id| id.get());
        Ok(Some(Self { content_size, dict_id }))
    }
}

pub struct ZstdFilter;

impl StreamFilter for ZstdFilter {
    fn name(&self) -> &'static str { "zstd" }

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
            return Err(VfsError::NotImplemented("zstd frames with a dictionary"));
        }
        debug!("zstd frame: {header:?}");

        let dctx = Decoder::new().map_err(|e| VfsError::BadFs(format!("zstd: {e}")))?;
        let source = ZstdSource {
            stream_start: file.offset(),
            inner: file,
            dctx,
            in_buf: zeroed_buf(WINDOW_SIZE)?,
            out_buf: zeroed_buf(WINDOW_SIZE)?,
            in_pos: 0,
            in_len: 0,
            out_start: 0,
            out_len: 0,
            finished: false,
            inner_eof: false,
        };
        Ok(FilterOutcome::Wrapped(File::new(Box::new(source), header.content_size)))
    }
}

struct ZstdSource {
    inner:        File,
    stream_start: u64,
    dctx:         Decoder<'static>,
    in_buf:       Vec<u8>,
    out_buf:      Vec<u8>,
    in_pos:       usize,
    in_len:       usize,
    /// Uncompressed offset of `out_buf[0]`.
    out_start:    u64,
    out_len:      usize,
    finished:     bool,
    inner_eof:    bool,
}

impl ZstdSource {
    fn restart(&mut self) -> Result<()> {
        self.dctx
            .reinit()
            .map_err(|e| VfsError::BadCompressedData(format!("zstd: {e}")))?;
        self.inner.seek(self.stream_start)?;
        self.in_pos = 0;
        self.in_len = 0;
        self.out_start = 0;
        self.out_len = 0;
        self.finished = false;
        self.inner_eof = false;
        Ok(())
    }

    /// Replace the output window with the next decoded run.  Leaves the
    /// window empty and sets `finished` once the frame is complete.
    fn decode_more(&mut self) -> Result<()> {
        self.out_start += self.out_len as u64;
        self.out_len = 0;
        loop {
            if self.in_pos == self.in_len && !self.inner_eof {
                self.in_len = self.inner.read(&mut self.in_buf)?;
                self.in_pos = 0;
                self.inner_eof = self.in_len == 0;
            }

            let mut input = InBuffer::around(&self.in_buf[self.in_pos..self.in_len]);
            let mut output = OutBuffer::around(&mut self.out_buf[..]);
            let hint = self
                .dctx
                .run(&mut input, &mut output)
                .map_err(|e| VfsError::BadCompressedData(format!("zstd: {e}")))?;
            self.in_pos += input.pos();
            self.out_len = output.pos();

            if hint == 0 {
                self.finished = true;
                return Ok(());
            }
            if self.out_len > 0 {
                return Ok(());
            }
            if self.in_pos == self.in_len && self.inner_eof {
                return Err(VfsError::BadCompressedData("zstd stream truncated".into()));
            }
        }
    }
}

impl FileSource for ZstdSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset < self.out_start {
            debug!("zstd: backward read to {offset}, restarting");
            self.restart()?;
        }
        let mut done = 0usize;
        loop {
            let pos = offset + done as u64;
            let end = self.out_start + self.out_len as u64;
            if pos >= self.out_start && pos < end {
                let from = (pos - self.out_start) as usize;
                let n = (self.out_len - from).min(buf.len() - done);
                buf[done..done + n].copy_from_slice(&self.out_buf[from..from + n]);
                done += n;
            }
            if done == buf.len() || self.finished {
                return Ok(done);
            }
            self.decode_more()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
        (0..len).map(|i| ((i * 7) ^ (i >> 10)) as u8).collect()
    }

    fn open(data: Vec<u8>) -> File {
        match ZstdFilter.try_open(file(data), FileType::NONE).unwrap() {
            FilterOutcome::Wrapped(f) => f,
            FilterOutcome::Passthrough(_) => panic!("zstd frame not recognised"),
        }
    }

    fn read_all(f: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 5000];
        loop {
            let n = f.read(&mut chunk).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn header_fields() {
        let packed = ::zstd::bulk::compress(&payload(1000), 3).unwrap();
        let hdr = FrameHeader::parse(&packed).unwrap().unwrap();
        assert_eq!(hdr.content_size, Some(1000));
        assert_eq!(hdr.dict_id, None);

        assert_eq!(FrameHeader::parse(b"\x28\xb5\x2f\xfe\x00").unwrap(), None);
        let bad = [0x28, 0xb5, 0x2f, 0xfd, 0x08, 0x00];
        assert!(matches!(FrameHeader::parse(&bad), Err(VfsError::BadFs(_))));
        // Eight-byte content size announced, two bytes present.
        let short = [0x28, 0xb5, 0x2f, 0xfd, 0xc0, 0x00, 0x10, 0x27];
        assert!(matches!(FrameHeader::parse(&short), Err(VfsError::BadFs(_))));
    }

    #[test]
    fn decodes_across_windows() {
        let data = payload(400_000);
        let mut f = open(::zstd::bulk::compress(&data, 5).unwrap());
        assert_eq!(f.size(), Some(data.len() as u64));
        assert!(read_all(&mut f) == data);
    }

    #[test]
    fn unknown_size_stops_at_frame_end() {
        let data = payload(70_000);
        let mut enc = ::zstd::stream::Encoder::new(Vec::new(), 3).unwrap();
        enc.include_contentsize(false).unwrap();
        std::io::Write::write_all(&mut enc, &data).unwrap();
        let packed = enc.finish().unwrap();

        let mut f = open(packed);
        assert_eq!(f.size(), None);
        assert!(read_all(&mut f) == data);
    }

    #[test]
    fn backward_seek_replays() {
        let data = payload(300_000);
        let mut f = open(::zstd::bulk::compress(&data, 3).unwrap());
        let mut buf = vec![0u8; 2048];
        f.seek(260_000).unwrap();
        f.read_full(&mut buf).unwrap();
        assert!(buf[..] == data[260_000..262_048]);
        f.seek(5).unwrap();
        f.read_full(&mut buf).unwrap();
        assert!(buf[..] == data[5..2053]);
    }

    #[test]
    fn truncated_stream_fails() {
        let data = payload(100_000);
        let mut packed = ::zstd::bulk::compress(&data, 3).unwrap();
        packed.truncate(packed.len() / 2);
        let mut f = open(packed);
        let mut buf = vec![0u8; data.len()];
        assert!(matches!(f.read_full(&mut buf), Err(VfsError::BadCompressedData(_))));
    }
}
