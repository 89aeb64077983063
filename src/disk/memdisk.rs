//! In-memory images registered by name.

use std::cell::RefCell;
use std::rc::Rc;

use super::{Disk, DiskDriver, DiskIo, DiskRegistry, PullClass, SECTOR_SIZE};
use crate::error::{Result, VfsError};

pub const DRIVER_NAME: &str = "memdisk";

#[derive(Default)]
pub struct MemDiskTable {
    images:  Vec<(String, Rc<[u8]>, u64)>,
    next_id: u64,
}

pub type SharedMemDisks = Rc<RefCell<MemDiskTable>>;

impl MemDiskTable {
    pub fn add(&mut self, name: &str, data: Vec<u8>) -> Result<u64> {
        if self.images.iter().any(|(n, _, _)| n == name) {
            return Err(VfsError::BadDevice(format!("device name `{name}' already exists")));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.images.push((name.to_string(), data.into(), id));
        Ok(id)
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let before = self.images.len();
        self.images.retain(|(n, _, _)| n != name);
        if before == self.images.len() {
            return Err(VfsError::BadDevice(format!("device `{name}' not found")));
        }
        Ok(())
    }
}

pub struct MemDiskDriver {
    table: SharedMemDisks,
}

impl MemDiskDriver {
    pub fn new(table: SharedMemDisks) -> Self {
        Self { table }
    }
}

impl DiskDriver for MemDiskDriver {
    fn name(&self) -> &'static str { DRIVER_NAME }

    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
        if pull != PullClass::None {
            return false;
        }
        let names: Vec<String> = self.table.borrow().images.iter().map(|(n, _, _)| n.clone()).collect();
        names.iter().any(|n| hook(n.as_str()))
    }

    fn open(&self, name: &str, _disks: &DiskRegistry) -> Result<Disk> {
        let table = self.table.borrow();
        let (_, data, id) = table
            .images
            .iter()
            .find(|(n, _, _)| n == name)
            .ok_or_else(|| VfsError::UnknownDevice(name.to_string()))?;
        let total = (data.len() as u64).div_ceil(SECTOR_SIZE);
        let io = MemDiskIo { data: Rc::clone(data) };
        Ok(Disk::new(name, DRIVER_NAME, *id, Some(total), Box::new(io)).with_max_agglomerate(u64::MAX))
    }
}

struct MemDiskIo {
    data: Rc<[u8]>,
}

impl DiskIo for MemDiskIo {
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(sector * SECTOR_SIZE)
            .map_err(|_| VfsError::OutOfRange("memdisk offset".into()))?;
        let avail = self.data.len().saturating_sub(start).min(buf.len());
        if avail > 0 {
            buf[..avail].copy_from_slice(&self.data[start..start + avail]);
        }
        buf[avail..].fill(0);
        Ok(())
    }
}
