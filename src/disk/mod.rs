//! Sector-addressed devices and the driver registry.
//!
//! A [`Disk`] is one opened backing store: physical drive, loopback image,
//! in-memory image or assembled RAID array.  Drivers implement
//! [`DiskDriver`] (naming, enumeration, open) and hand back a `Disk` whose
//! private [`DiskIo`] does the sector transfers.
//!
//! # Addressing
//! Sectors are always 512 bytes ([`SECTOR_SIZE`]).  [`Disk::read`] accepts a
//! sector plus a byte offset and any length; unaligned heads and tails go
//! through a one-sector bounce buffer, aligned spans are split into
//! transfers of at most `max_agglomerate` sectors.
//!
//! # Ownership
//! Every `open` builds a fresh `Disk`; nothing is shared between opens.
//! Dropping the `Disk` releases the driver state.

pub mod host;
pub mod loopback;
pub mod memdisk;

use log::debug;

use crate::error::{Result, VfsError};

pub const SECTOR_BITS: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_BITS;

/// Largest transfer a driver is asked for when it does not say otherwise.
pub const DEFAULT_MAX_AGGLOMERATE: u64 = 1 << 10;

// ── Enumeration classes ──────────────────────────────────────────────────────

/// Which devices an enumeration pass should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullClass {
    /// Devices that are available immediately (attached drives, mounts).
    None,
    /// Removable or slow media.
    Removable,
}

// ── Driver contracts ─────────────────────────────────────────────────────────

/// Sector transfer entry points of an opened device.
pub trait DiskIo {
    /// Fill `buf` (a whole number of sectors) starting at `sector`.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` (a whole number of sectors) starting at `sector`.
    fn write_sectors(&mut self, _sector: u64, _buf: &[u8]) -> Result<()> {
        Err(VfsError::NotImplemented("writing to this device"))
    }
}

/// A family of devices sharing one naming convention.
pub trait DiskDriver {
    /// Driver identity; the registry is keyed on it.
    fn name(&self) -> &'static str;

    /// Call `hook` with every device name this driver can open for `pull`.
    /// Returns `true` as soon as the hook asks to stop.
    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool;

    /// Open `name`.  Names this driver does not own must fail with
    /// [`VfsError::UnknownDevice`] so the registry keeps searching.
    ///
    /// `disks` gives drivers that stack on other devices (RAID) a way to
    /// open their members.
    fn open(&self, name: &str, disks: &DiskRegistry) -> Result<Disk>;
}

// ── Disk ─────────────────────────────────────────────────────────────────────

pub struct Disk {
    name:            String,
    driver:          &'static str,
    id:              u64,
    /// `None` when the backing store cannot report its length.
    total_sectors:   Option<u64>,
    max_agglomerate: u64,
    io:              Box<dyn DiskIo>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("id", &self.id)
            .field("total_sectors", &self.total_sectors)
            .field("max_agglomerate", &self.max_agglomerate)
            .finish()
    }
}

impl Disk {
    pub fn new(
        name:          impl Into<String>,
        driver:        &'static str,
        id:            u64,
        total_sectors: Option<u64>,
        io:            Box<dyn DiskIo>,
    ) -> Self {
        Self {
            name: name.into(),
            driver,
            id,
            total_sectors,
            max_agglomerate: DEFAULT_MAX_AGGLOMERATE,
            io,
        }
    }

    /// Cap single transfers at `sectors` (at least one).
    pub fn with_max_agglomerate(mut self, sectors: u64) -> Self {
        self.max_agglomerate = sectors.max(1);
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn driver(&self) -> &'static str { self.driver }
    pub fn id(&self) -> u64 { self.id }
    pub fn total_sectors(&self) -> Option<u64> { self.total_sectors }
    pub fn max_agglomerate(&self) -> u64 { self.max_agglomerate }

    /// Device size in bytes, when known.
    pub fn size(&self) -> Option<u64> {
        self.total_sectors.and_then(|s| s.checked_mul(SECTOR_SIZE))
    }

    /// Read `buf.len()` bytes starting `offset` bytes into `sector`.
    pub fn read(&mut self, sector: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut sector, head) = self.normalize(sector, offset, buf.len())?;
        let mut done = 0usize;

        if head != 0 {
            let mut bounce = [0u8; SECTOR_SIZE as usize];
            self.io.read_sectors(sector, &mut bounce)?;
            let n = (SECTOR_SIZE as usize - head).min(buf.len());
            buf[..n].copy_from_slice(&bounce[head..head + n]);
            done = n;
            sector += 1;
        }

        let whole = (buf.len() - done) & !(SECTOR_SIZE as usize - 1);
        if whole > 0 {
            self.read_aligned(sector, &mut buf[done..done + whole])?;
            done += whole;
            sector += (whole >> SECTOR_BITS) as u64;
        }

        if done < buf.len() {
            let mut bounce = [0u8; SECTOR_SIZE as usize];
            self.io.read_sectors(sector, &mut bounce)?;
            let n = buf.len() - done;
            buf[done..].copy_from_slice(&bounce[..n]);
        }
        Ok(())
    }

    /// Write `buf` starting `offset` bytes into `sector`.  Partial sectors
    /// are read, patched and written back.
    pub fn write(&mut self, sector: u64, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut sector, head) = self.normalize(sector, offset, buf.len())?;
        let mut done = 0usize;

        if head != 0 {
            let mut bounce = [0u8; SECTOR_SIZE as usize];
            self.io.read_sectors(sector, &mut bounce)?;
            let n = (SECTOR_SIZE as usize - head).min(buf.len());
            bounce[head..head + n].copy_from_slice(&buf[..n]);
            self.io.write_sectors(sector, &bounce)?;
            done = n;
            sector += 1;
        }

        let whole = (buf.len() - done) & !(SECTOR_SIZE as usize - 1);
        if whole > 0 {
            for chunk in buf[done..done + whole].chunks(self.transfer_bytes()) {
                self.io.write_sectors(sector, chunk)?;
                sector += (chunk.len() >> SECTOR_BITS) as u64;
            }
            done += whole;
        }

        if done < buf.len() {
            let mut bounce = [0u8; SECTOR_SIZE as usize];
            self.io.read_sectors(sector, &mut bounce)?;
            let n = buf.len() - done;
            bounce[..n].copy_from_slice(&buf[done..]);
            self.io.write_sectors(sector, &bounce)?;
        }
        Ok(())
    }

    /// Release the device.  Equivalent to dropping it.
    pub fn close(self) {
        debug!("closing disk `{}'", self.name);
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Fold whole sectors of `offset` into `sector` and reject transfers that
    /// end past a known device size.
    fn normalize(&self, sector: u64, offset: u64, len: usize) -> Result<(u64, usize)> {
        let sector = sector
            .checked_add(offset >> SECTOR_BITS)
            .ok_or_else(|| self.outside())?;
        let head = (offset & (SECTOR_SIZE - 1)) as usize;

        if let Some(total) = self.total_sectors {
            let end = (sector as u128) * SECTOR_SIZE as u128 + head as u128 + len as u128;
            if end > total as u128 * SECTOR_SIZE as u128 {
                return Err(self.outside());
            }
        }
        Ok((sector, head))
    }

    fn read_aligned(&mut self, mut sector: u64, buf: &mut [u8]) -> Result<()> {
        let max = self.transfer_bytes();
        for chunk in buf.chunks_mut(max) {
            self.io.read_sectors(sector, chunk)?;
            sector += (chunk.len() >> SECTOR_BITS) as u64;
        }
        Ok(())
    }

    fn transfer_bytes(&self) -> usize {
        usize::try_from(self.max_agglomerate.saturating_mul(SECTOR_SIZE)).unwrap_or(usize::MAX)
            & !(SECTOR_SIZE as usize - 1)
    }

    fn outside(&self) -> VfsError {
        VfsError::OutOfRange(format!("attempt to read or write outside of disk `{}'", self.name))
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Ordered set of device drivers.  `open` asks each driver in registration
/// order; the first one that owns the name wins.
#[derive(Default)]
pub struct DiskRegistry {
    drivers: Vec<Box<dyn DiskDriver>>,
}

impl DiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `driver`.  A driver already registered under the same name is
    /// replaced and moves to the end.
    pub fn register(&mut self, driver: Box<dyn DiskDriver>) {
        self.unregister(driver.name());
        debug!("registering disk driver `{}'", driver.name());
        self.drivers.push(driver);
    }

    /// Remove the driver called `name`.  Returns whether one was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.drivers.len();
        self.drivers.retain(|d| d.name() != name);
        before != self.drivers.len()
    }

    /// Enumerate device names of every driver for `pull`.  Returns `true`
    /// when the hook stopped the walk.
    pub fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
        self.drivers.iter().any(|d| d.iterate(hook, pull))
    }

    pub fn open(&self, name: &str) -> Result<Disk> {
        for driver in &self.drivers {
            match driver.open(name, self) {
                Ok(disk) => {
                    debug!(
                        "opened `{}' via {} ({:?} sectors)",
                        name, driver.name(), disk.total_sectors()
                    );
                    return Ok(disk);
                }
                Err(VfsError::UnknownDevice(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VfsError::UnknownDevice(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sector `n` is filled with byte `n as u8`; counts transfers.
    struct Pattern {
        transfers: std::rc::Rc<std::cell::Cell<usize>>,
        written:   std::rc::Rc<std::cell::RefCell<Vec<(u64, Vec<u8>)>>>,
    }

    impl DiskIo for Pattern {
        fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
            assert_eq!(buf.len() % SECTOR_SIZE as usize, 0);
            self.transfers.set(self.transfers.get() + 1);
            for (i, chunk) in buf.chunks_mut(SECTOR_SIZE as usize).enumerate() {
                chunk.fill((sector + i as u64) as u8);
            }
            Ok(())
        }

        fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
            self.written.borrow_mut().push((sector, buf.to_vec()));
            Ok(())
        }
    }

    fn pattern_disk(total: u64) -> (Disk, std::rc::Rc<std::cell::Cell<usize>>) {
        let transfers = std::rc::Rc::new(std::cell::Cell::new(0));
        let io = Pattern { transfers: transfers.clone(), written: Default::default() };
        (Disk::new("pat", "test", 0, Some(total), Box::new(io)), transfers)
    }

    #[test]
    fn unaligned_read_spans_sectors() {
        let (mut disk, _) = pattern_disk(8);
        let mut buf = vec![0u8; 600];
        disk.read(1, 500, &mut buf).unwrap();
        assert!(buf[..12].iter().all(|&b| b == 1));
        assert!(buf[12..524].iter().all(|&b| b == 2));
        assert!(buf[524..].iter().all(|&b| b == 3));
    }

    #[test]
    fn offset_folds_into_sector() {
        let (mut disk, _) = pattern_disk(8);
        let mut buf = [0u8; 4];
        disk.read(0, 3 * 512 + 10, &mut buf).unwrap();
        assert_eq!(buf, [3; 4]);
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let (mut disk, _) = pattern_disk(2);
        let mut buf = [0u8; 2];
        assert!(matches!(disk.read(1, 511, &mut buf), Err(VfsError::OutOfRange(_))));
        disk.read(1, 510, &mut buf).unwrap();
    }

    #[test]
    fn transfers_respect_agglomerate_limit() {
        let (disk, transfers) = pattern_disk(64);
        let mut disk = disk.with_max_agglomerate(4);
        let mut buf = vec![0u8; 10 * 512];
        disk.read(0, 0, &mut buf).unwrap();
        assert_eq!(transfers.get(), 3);
        assert_eq!(buf[9 * 512], 9);
    }

    #[test]
    fn partial_write_read_modify_writes() {
        let written = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let io = Pattern { transfers: Default::default(), written: written.clone() };
        let mut disk = Disk::new("pat", "test", 0, Some(4), Box::new(io));
        disk.write(1, 2, b"xy").unwrap();
        let log = written.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 1);
        assert_eq!(&log[0].1[..4], &[1, 1, b'x', b'y']);
    }

    struct Named(&'static str);

    impl DiskDriver for Named {
        fn name(&self) -> &'static str { self.0 }
        fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
            pull == PullClass::None && hook(self.0)
        }
        fn open(&self, name: &str, _: &DiskRegistry) -> Result<Disk> {
            if name != self.0 {
                return Err(VfsError::UnknownDevice(name.into()));
            }
            let io = Pattern { transfers: Default::default(), written: Default::default() };
            Ok(Disk::new(name, self.0, 7, Some(1), Box::new(io)))
        }
    }

    #[test]
    fn registry_searches_in_order() {
        let mut reg = DiskRegistry::new();
        reg.register(Box::new(Named("a")));
        reg.register(Box::new(Named("b")));
        assert_eq!(reg.open("b").unwrap().driver(), "b");
        assert!(matches!(reg.open("c"), Err(VfsError::UnknownDevice(_))));

        let mut seen = Vec::new();
        reg.iterate(&mut |n| { seen.push(n.to_string()); false }, PullClass::None);
        assert_eq!(seen, ["a", "b"]);

        assert!(reg.unregister("a"));
        assert!(matches!(reg.open("a"), Err(VfsError::UnknownDevice(_))));
    }
}
