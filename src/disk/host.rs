//! Host devices: physical drives (`hd0`, `hd1`, ...) and the `host` root
//! device that the host filesystem driver sits on.
//!
//! Drive `hdN` maps to the N-th configured backing path.  Reads use
//! positioned I/O on a `std::fs::File`; a single transfer is limited to
//! 4 GiB.  Writes exist only when the crate is built with the `disk-write`
//! feature.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use log::debug;

use super::{Disk, DiskDriver, DiskIo, DiskRegistry, PullClass, SECTOR_SIZE};
use crate::error::{Result, VfsError};

pub const DRIVER_NAME: &str = "hostdisk";
pub const HOST_DRIVER_NAME: &str = "host";

/// Device name of the host root device.
pub const HOST_DEVICE: &str = "host";

/// Device id the host filesystem driver checks for.
pub const HOST_DEVICE_ID: u64 = 0x686f_7374;

/// Single transfers above this size are refused.
const MAX_TRANSFER: usize = u32::MAX as usize;

// ── Physical drives ──────────────────────────────────────────────────────────

pub struct HostDiskDriver {
    paths: Vec<PathBuf>,
}

impl HostDiskDriver {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// Collect the platform's physical drives.  Only Windows exposes a
    /// numbered drive namespace; elsewhere the list is empty and drives are
    /// configured explicitly.
    pub fn discover() -> Vec<PathBuf> {
        let mut found = Vec::new();
        if cfg!(windows) {
            for index in 0..64 {
                let path = PathBuf::from(format!(r"\\.\PhysicalDrive{index}"));
                if fs::File::open(&path).is_ok() {
                    found.push(path);
                }
            }
        }
        debug!("discovered {} host drive(s)", found.len());
        found
    }

    /// Drive index of `hd<N>`.  Names that do not continue with a digit
    /// after `hd` belong to some other driver.
    fn parse_index(&self, name: &str) -> Result<usize> {
        let digits = name
            .strip_prefix("hd")
            .filter(|d| d.starts_with(|c: char| c.is_ascii_digit()))
            .ok_or_else(|| VfsError::UnknownDevice(name.to_string()))?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(VfsError::BadDevice(format!("malformed drive index in `{name}'")));
        }
        digits
            .parse::<usize>()
            .map_err(|_| VfsError::BadDevice(format!("malformed drive index in `{name}'")))
    }
}

impl DiskDriver for HostDiskDriver {
    fn name(&self) -> &'static str { DRIVER_NAME }

    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
        if pull != PullClass::None {
            return false;
        }
        (0..self.paths.len()).any(|i| hook(format!("hd{i}").as_str()))
    }

    fn open(&self, name: &str, _disks: &DiskRegistry) -> Result<Disk> {
        let index = self.parse_index(name)?;
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| VfsError::UnknownDevice(name.to_string()))?;

        let mut file = open_backing(path)?;
        let len = file
            .seek(SeekFrom::End(0))
            .map_err(|e| VfsError::Read(format!("cannot size `{}': {e}", path.display())))?;
        debug!("{name} -> {} ({len} bytes)", path.display());

        let io = HostDiskIo { file, len };
        Ok(Disk::new(name, DRIVER_NAME, index as u64, Some(len / SECTOR_SIZE), Box::new(io)))
    }
}

#[cfg(feature = "disk-write")]
fn open_backing(path: &std::path::Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .or_else(|_| fs::File::open(path))
        .map_err(|e| VfsError::UnknownDevice(format!("{}: {e}", path.display())))
}

#[cfg(not(feature = "disk-write"))]
fn open_backing(path: &std::path::Path) -> Result<fs::File> {
    fs::File::open(path).map_err(|e| VfsError::UnknownDevice(format!("{}: {e}", path.display())))
}

struct HostDiskIo {
    file: fs::File,
    len:  u64,
}

impl HostDiskIo {
    fn position(&mut self, sector: u64, len: usize) -> Result<()> {
        if len > MAX_TRANSFER {
            return Err(VfsError::OutOfRange("transfer larger than 4 GiB".into()));
        }
        let pos = sector
            .checked_mul(SECTOR_SIZE)
            .filter(|p| p.saturating_add(len as u64) <= self.len)
            .ok_or_else(|| VfsError::OutOfRange(format!("sector {sector} is beyond the device")))?;
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| VfsError::OutOfRange(format!("seek to sector {sector} failed: {e}")))?;
        Ok(())
    }
}

impl DiskIo for HostDiskIo {
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.position(sector, buf.len())?;
        self.file
            .read_exact(buf)
            .map_err(|e| VfsError::Read(format!("failure reading sector {sector}: {e}")))
    }

    #[cfg(feature = "disk-write")]
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.position(sector, buf.len())?;
        self.file
            .write_all(buf)
            .map_err(|e| VfsError::Read(format!("failure writing sector {sector}: {e}")))
    }
}

// ── Host root device ─────────────────────────────────────────────────────────

/// Provides the zero-sector `host` device.  It carries no data of its own;
/// `fs::hostfs` recognises it by id and serves host paths.
pub struct HostRootDriver;

impl DiskDriver for HostRootDriver {
    fn name(&self) -> &'static str { HOST_DRIVER_NAME }

    fn iterate(&self, _hook: &mut dyn FnMut(&str) -> bool, _pull: PullClass) -> bool {
        false
    }

    fn open(&self, name: &str, _disks: &DiskRegistry) -> Result<Disk> {
        if name != HOST_DEVICE {
            return Err(VfsError::UnknownDevice(name.to_string()));
        }
        Ok(Disk::new(name, HOST_DRIVER_NAME, HOST_DEVICE_ID, Some(0), Box::new(NoMedia)))
    }
}

struct NoMedia;

impl DiskIo for NoMedia {
    fn read_sectors(&mut self, sector: u64, _buf: &mut [u8]) -> Result<()> {
        Err(VfsError::OutOfRange(format!("sector {sector} on a device without media")))
    }
}
