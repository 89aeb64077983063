//! Transparent stream filters.
//!
//! A filter inspects a freshly opened [`File`] and either hands it back
//! untouched or wraps it in a new `File` whose source decodes the inner one.
//! The wrapper owns the inner handle, so dropping the outermost file closes
//! the whole chain.
//!
//! Filters run in registration order on every `file_open`; each sees the
//! result of the previous one.  [`FileType::NO_DECOMPRESS`] turns them all
//! into pass-throughs.

pub mod lz4;
pub mod zstd;

use log::debug;

use crate::error::Result;
use crate::file::{File, FileType};

/// What a filter did with the file it was offered.
#[derive(Debug)]
pub enum FilterOutcome {
    /// Header did not match or decoding was not requested; stream position
    /// is unchanged.
    Passthrough(File),
    /// A new handle decoding the inner file.
    Wrapped(File),
}

pub trait StreamFilter {
    fn name(&self) -> &'static str;

    /// Inspect `file` and wrap it if it carries this filter's container.
    /// A container whose header is present but malformed is an error; the
    /// inner file is dropped with it.
    fn try_open(&self, file: File, file_type: FileType) -> Result<FilterOutcome>;
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// The built-in filters in their standard order.
pub fn default_filters() -> Vec<Box<dyn StreamFilter>> {
    let filters: [Box<dyn StreamFilter>; 2] = [Box::new(lz4::Lz4Filter), Box::new(zstd::ZstdFilter)];
    filters.into()
}

/// Run `file` through `filters` in order.  Every wrapper takes over the
/// display name and type flags of the handle it wraps.
pub fn apply(filters: &[Box<dyn StreamFilter>], file: File, file_type: FileType) -> Result<File> {
    let mut file = file;
    for filter in filters {
        let name = file.name().to_string();
        file = match filter.try_open(file, file_type)? {
            FilterOutcome::Passthrough(f) => f,
            FilterOutcome::Wrapped(mut f) => {
                debug!("`{name}' decoded by {}", filter.name());
                f.set_name(name);
                f.set_file_type(file_type);
                f.set_not_easily_seekable(true);
                f
            }
        };
    }
    Ok(file)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Read up to `buf.len()` bytes at the current offset, then put the offset
/// back.  Returns the byte count read.
pub(crate) fn peek(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let start = file.offset();
    let n = file.read_full(buf);
    file.seek(start)?;
    n
}
