//! Error taxonomy shared by every layer: devices, filesystems, files and
//! stream filters.
//!
//! Each call returns its own [`VfsError`]; there is no process-wide "last
//! error" slot.  Probing and filter-chain iteration inspect the kind with
//! [`VfsError::is_probe_recoverable`] and move on to the next candidate when
//! the failure only means "not mine".

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    /// No registered driver recognises the device name.
    #[error("unknown device `{0}'")]
    UnknownDevice(String),
    /// The name was recognised but is unusable (duplicate loopback name,
    /// malformed drive index, inconsistent array geometry).
    #[error("bad device: {0}")]
    BadDevice(String),
    /// Seek or read beyond a known extent, or an oversized single transfer.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// Underlying I/O failed while reading sectors.
    #[error("read error: {0}")]
    Read(String),
    /// A filesystem driver or container header rejected the data.
    #[error("bad filesystem: {0}")]
    BadFs(String),
    /// Probing exhausted every registered filesystem driver.
    #[error("unknown filesystem")]
    UnknownFilesystem,
    /// A stream filter hit corrupt data after its header was accepted.
    #[error("bad compressed data: {0}")]
    BadCompressedData(String),
    /// Malformed `(device)/path` or block-list syntax.
    #[error("invalid file name `{0}'")]
    BadFilename(String),
    #[error("file `{0}' not found")]
    FileNotFound(String),
    #[error("`{0}' is not a directory")]
    NotADirectory(String),
    /// Disabled or unsupported operation (read-only drivers, gated writes).
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    /// RAID reconstruction ran out of redundancy.
    #[error("too many bad devices")]
    TooManyBadDevices,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, VfsError>;

impl VfsError {
    /// Errors that only mean "this driver does not recognise the device".
    /// Probing clears them and tries the next driver.
    pub fn is_probe_recoverable(&self) -> bool {
        matches!(self, VfsError::BadFs(_) | VfsError::OutOfRange(_))
    }

    /// Errors after which a RAID member is treated as failed and rebuilt
    /// from redundancy.
    pub fn is_member_failure(&self) -> bool {
        matches!(
            self,
            VfsError::Read(_) | VfsError::Io(_) | VfsError::UnknownDevice(_)
        )
    }
}

impl From<io::Error> for VfsError {
    fn from(err: io::Error) -> Self {
        // The std::io adapters on `File` box a VfsError; hand back the
        // original kind instead of burying it under `Io`.
        if !err.get_ref().is_some_and(|inner| inner.is::<VfsError>()) {
            return VfsError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<VfsError>()) {
            Some(Ok(vfs)) => *vfs,
            _ => VfsError::Read("unrecoverable wrapped error".into()),
        }
    }
}

impl From<VfsError> for io::Error {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Allocate a zero-filled scratch buffer, reporting allocation failure as
/// [`VfsError::OutOfMemory`] instead of aborting.
pub(crate) fn zeroed_buf(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| VfsError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_roundtrip_preserves_kind() {
        let io_err: io::Error = VfsError::OutOfRange("past end".into()).into();
        let back: VfsError = io_err.into();
        assert!(matches!(back, VfsError::OutOfRange(_)));
    }

    #[test]
    fn plain_io_error_is_wrapped() {
        let err: VfsError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, VfsError::Io(_)));
    }

    #[test]
    fn probe_recoverable_kinds() {
        assert!(VfsError::BadFs("x".into()).is_probe_recoverable());
        assert!(VfsError::OutOfRange("x".into()).is_probe_recoverable());
        assert!(!VfsError::Read("x".into()).is_probe_recoverable());
        assert!(!VfsError::UnknownFilesystem.is_probe_recoverable());
    }
}
