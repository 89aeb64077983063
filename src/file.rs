//! The open-file handle.
//!
//! A [`File`] is a cursor (offset, size) over a [`FileSource`].  Sources are
//! what filesystem drivers and stream filters produce: a filesystem file owns
//! its [`Disk`](crate::disk::Disk); a filter's source owns the inner `File`
//! it decodes.  Dropping the outermost handle therefore closes the whole
//! chain down to the device.
//!
//! # Offsets and size
//! `size` is `None` when the content length is not known up front (streamed
//! or decompressed content without a declared size).  With a known size:
//! reads are clamped to the remaining bytes, a read starting past the end is
//! an error, and seeking is allowed anywhere in `0..=size`.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};

use log::trace;

use crate::error::{Result, VfsError};

// ── Type flags ───────────────────────────────────────────────────────────────

/// Why a file is being opened.  Only [`FileType::NO_DECOMPRESS`] changes
/// behaviour; the rest are hints for filters and hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileType(pub u32);

impl FileType {
    pub const NONE:          FileType = FileType(0);
    /// Backing image of a loopback device.
    pub const LOOPBACK:      FileType = FileType(1 << 0);
    /// Content is read to compute or verify hashes.
    pub const HASH_LIST:     FileType = FileType(1 << 1);
    /// Theme or image asset read by a presentation layer.
    pub const THEME:         FileType = FileType(1 << 2);
    /// Plain file copy or extraction.
    pub const EXTRACT:       FileType = FileType(1 << 3);
    /// Skip every stream filter and expose the stored bytes.
    pub const NO_DECOMPRESS: FileType = FileType(1 << 31);

    pub fn contains(self, other: FileType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FileType {
    type Output = FileType;
    fn bitor(self, rhs: FileType) -> FileType { FileType(self.0 | rhs.0) }
}

impl BitOrAssign for FileType {
    fn bitor_assign(&mut self, rhs: FileType) { self.0 |= rhs.0; }
}

// ── Source contract ──────────────────────────────────────────────────────────

/// Positioned reads over one file's content.
pub trait FileSource {
    /// Read up to `buf.len()` bytes at `offset`.  Returning fewer bytes (or
    /// zero) means the content ended.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Progress hook: `(offset, bytes_read, size)` after every read.  Hosts use
/// it to drive progress displays and to notice abort requests between reads.
pub type ReadHook = dyn FnMut(u64, usize, Option<u64>);

// ── File ─────────────────────────────────────────────────────────────────────

pub struct File {
    name:                String,
    offset:              u64,
    size:                Option<u64>,
    file_type:           FileType,
    not_easily_seekable: bool,
    read_hook:           Option<Box<ReadHook>>,
    source:              Box<dyn FileSource>,
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("file_type", &self.file_type)
            .field("not_easily_seekable", &self.not_easily_seekable)
            .finish()
    }
}

impl File {
    pub fn new(source: Box<dyn FileSource>, size: Option<u64>) -> Self {
        Self {
            name: String::new(),
            offset: 0,
            size,
            file_type: FileType::NONE,
            not_easily_seekable: false,
            read_hook: None,
            source,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn offset(&self) -> u64 { self.offset }
    pub fn size(&self) -> Option<u64> { self.size }
    pub fn file_type(&self) -> FileType { self.file_type }

    /// Backward seeks are expensive (a decompressor restarts from the
    /// beginning).  Consumers should prefer sequential access.
    pub fn not_easily_seekable(&self) -> bool { self.not_easily_seekable }

    pub fn set_name(&mut self, name: impl Into<String>) { self.name = name.into(); }
    pub fn set_file_type(&mut self, file_type: FileType) { self.file_type = file_type; }
    pub fn set_not_easily_seekable(&mut self, value: bool) { self.not_easily_seekable = value; }

    /// Install (or clear) the progress hook; returns the previous one.
    pub fn set_read_hook(&mut self, hook: Option<Box<ReadHook>>) -> Option<Box<ReadHook>> {
        std::mem::replace(&mut self.read_hook, hook)
    }

    /// Read at the current offset and advance by the bytes returned.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut len = buf.len();
        if let Some(size) = self.size {
            if self.offset > size {
                return Err(VfsError::OutOfRange(format!(
                    "attempt to read past the end of file `{}'", self.name
                )));
            }
            len = len.min(usize::try_from(size - self.offset).unwrap_or(usize::MAX));
        }
        if len == 0 {
            return Ok(0);
        }

        let got = self.source.read_at(self.offset, &mut buf[..len])?;
        match self.read_hook.as_mut() {
            Some(hook) => hook(self.offset, got, self.size),
            None => default_read_hook(&self.name, self.offset, got, self.size),
        }
        if got > 0 {
            self.offset += got as u64;
        }
        Ok(got)
    }

    /// Read until `buf` is full or the content ends.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Move to `offset` and return the previous offset.  Seeking past a
    /// known size fails; `offset == size` is allowed.
    pub fn seek(&mut self, offset: u64) -> Result<u64> {
        if self.size.is_some_and(|size| offset > size) {
            return Err(VfsError::OutOfRange(format!(
                "attempt to seek outside of the file `{}'", self.name
            )));
        }
        Ok(std::mem::replace(&mut self.offset, offset))
    }

    /// Release the handle and everything it wraps.
    pub fn close(self) {
        trace!("closing `{}'", self.name);
    }
}

fn default_read_hook(name: &str, offset: u64, len: usize, size: Option<u64>) {
    trace!("`{name}': {len} byte(s) at {offset} of {size:?}");
}

// ── std::io adapters ─────────────────────────────────────────────────────────

impl io::Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        File::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Seek for File {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(off) => Some(off),
            io::SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
            io::SeekFrom::End(delta) => {
                let size = self.size.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "file size is unknown")
                })?;
                size.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        File::seek(self, target).map_err(io::Error::from)?;
        Ok(target)
    }
}

// ── Name syntax ──────────────────────────────────────────────────────────────

/// Split `(device)path` into the device name and the remainder.  A name that
/// does not start with `(` has no device part.
pub fn split_name(name: &str) -> Result<(Option<&str>, &str)> {
    match name.strip_prefix('(') {
        Some(rest) => {
            let close = rest
                .find(')')
                .ok_or_else(|| VfsError::BadFilename(name.to_string()))?;
            Ok((Some(&rest[..close]), &rest[close + 1..]))
        }
        None => Ok((None, name)),
    }
}
