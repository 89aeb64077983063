//! Loopback devices: named disks backed by an open [`File`].
//!
//! The backing file is whatever `file_open` produced for the image path, so
//! a compressed image mounts as its decompressed content unless the mount
//! asked for raw bytes.  Loopback devices are read-only.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use super::{Disk, DiskDriver, DiskIo, DiskRegistry, PullClass, SECTOR_BITS, SECTOR_SIZE};
use crate::error::{Result, VfsError};
use crate::file::File;

/// Loopback transfers are capped at 512 MiB.
pub const LOOPBACK_MAX_AGGLOMERATE: u64 = (512 << 20) >> SECTOR_BITS;

pub const DRIVER_NAME: &str = "loopback";

// ── Registration table ───────────────────────────────────────────────────────

struct Registration {
    name:       String,
    file:       Rc<RefCell<File>>,
    id:         u64,
    decompress: bool,
}

/// Name → backing file table.  Names are unique; ids only grow.
#[derive(Default)]
pub struct LoopbackTable {
    entries: Vec<Registration>,
    next_id: u64,
}

/// Handle shared between the session (which mounts and unmounts) and the
/// driver (which opens).
pub type SharedLoopbacks = Rc<RefCell<LoopbackTable>>;

impl LoopbackTable {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Register `file` under `name`.  Fails without side effects when the
    /// name is taken.  Returns the new device id.
    pub fn add(&mut self, name: &str, file: File, decompress: bool) -> Result<u64> {
        if self.contains(name) {
            return Err(VfsError::BadDevice(format!("device name `{name}' already exists")));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Registration {
            name: name.to_string(),
            file: Rc::new(RefCell::new(file)),
            id,
            decompress,
        });
        debug!("loopback `{name}' registered as id {id}");
        Ok(id)
    }

    /// Unregister `name` and release its backing file.  Disks that are still
    /// open keep the file alive until they close.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| VfsError::BadDevice(format!("device `{name}' not found")))?;
        self.entries.remove(idx);
        debug!("loopback `{name}' deleted");
        Ok(())
    }

    /// `(name, id, decompress)` for every registration.
    pub fn list(&self) -> Vec<(String, u64, bool)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.id, e.decompress))
            .collect()
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct LoopbackDriver {
    table: SharedLoopbacks,
}

impl LoopbackDriver {
    pub fn new(table: SharedLoopbacks) -> Self {
        Self { table }
    }
}

impl DiskDriver for LoopbackDriver {
    fn name(&self) -> &'static str { DRIVER_NAME }

    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
        if pull != PullClass::None {
            return false;
        }
        let names: Vec<String> = self.table.borrow().entries.iter().map(|e| e.name.clone()).collect();
        names.iter().any(|n| hook(n.as_str()))
    }

    fn open(&self, name: &str, _disks: &DiskRegistry) -> Result<Disk> {
        let table = self.table.borrow();
        let entry = table
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| VfsError::UnknownDevice(name.to_string()))?;

        let size = entry
            .file
            .try_borrow()
            .map_err(|_| VfsError::BadDevice(format!("loopback `{name}' is busy")))?
            .size();
        let total_sectors = size.map(|s| s.div_ceil(SECTOR_SIZE));

        let io = LoopbackIo { file: Rc::clone(&entry.file) };
        Ok(Disk::new(name, DRIVER_NAME, entry.id, total_sectors, Box::new(io))
            .with_max_agglomerate(LOOPBACK_MAX_AGGLOMERATE))
    }
}

struct LoopbackIo {
    file: Rc<RefCell<File>>,
}

impl DiskIo for LoopbackIo {
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self
            .file
            .try_borrow_mut()
            .map_err(|_| VfsError::Read("loopback backing file is busy".into()))?;
        let offset = sector
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| VfsError::OutOfRange(format!("sector {sector} is beyond any loopback image")))?;
        file.seek(offset)?;
        let got = file.read_full(buf)?;
        // Images whose length is not a sector multiple end in a short read.
        buf[got..].fill(0);
        Ok(())
    }

    fn write_sectors(&mut self, _sector: u64, _buf: &[u8]) -> Result<()> {
        Err(VfsError::NotImplemented("writing to a loopback device"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileSource;

    /// Endless `0x5a` bytes with no known length.
    struct Endless;

    impl FileSource for Endless {
        fn read_at(&mut self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
            buf.fill(0x5a);
            Ok(buf.len())
        }
    }

    fn open(file: File) -> Disk {
        let table = Rc::new(RefCell::new(LoopbackTable::default()));
        table.borrow_mut().add("ld0", file, true).unwrap();
        LoopbackDriver::new(table).open("ld0", &DiskRegistry::new()).unwrap()
    }

    #[test]
    fn unsized_image_rejects_unaddressable_sectors() {
        let mut disk = open(File::new(Box::new(Endless), None));
        assert_eq!(disk.total_sectors(), None);
        let mut buf = [0u8; 8];
        disk.read(1 << 40, 3, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 8]);
        assert!(matches!(disk.read(u64::MAX >> 8, 0, &mut buf), Err(VfsError::OutOfRange(_))));
    }

    #[test]
    fn duplicate_names_are_refused() {
        let table = Rc::new(RefCell::new(LoopbackTable::default()));
        table.borrow_mut().add("ld0", File::new(Box::new(Endless), None), true).unwrap();
        let again = table.borrow_mut().add("ld0", File::new(Box::new(Endless), None), false);
        assert!(matches!(again, Err(VfsError::BadDevice(_))));
        assert_eq!(table.borrow().list(), [("ld0".to_string(), 0, true)]);
    }
}
