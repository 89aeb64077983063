//! Filesystem drivers and the probe protocol.
//!
//! Drivers are stateless singletons kept in registration order.  Probing a
//! disk asks each driver to list the root directory with a hook that stops
//! at the first entry; the first driver that gets through without an error
//! owns the disk.  `BadFs` and `OutOfRange` mean "not mine" and probing moves
//! on; any other error ends the probe.

pub mod blocklist;
pub mod fat;
pub mod hostfs;

use log::{debug, warn};

use crate::disk::Disk;
use crate::error::{Result, VfsError};
use crate::file::File;

/// Metadata passed to directory hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirInfo {
    pub is_dir: bool,
    pub size:   Option<u64>,
    /// Modification time, seconds since the Unix epoch.
    pub mtime:  Option<i64>,
}

/// Directory hook: return `true` to stop the listing.
pub type DirHook<'a> = dyn FnMut(&str, &DirInfo) -> bool + 'a;

pub trait FsDriver {
    fn name(&self) -> &'static str;

    /// List `path` on `disk`, calling `hook` per entry until it returns true.
    fn dir(&self, disk: &mut Disk, path: &str, hook: &mut DirHook<'_>) -> Result<()>;

    /// Open `path`.  The returned file owns `disk`.
    fn open(&self, disk: Disk, path: &str) -> Result<File>;

    fn label(&self, _disk: &mut Disk) -> Result<Option<String>> {
        Ok(None)
    }

    fn uuid(&self, _disk: &mut Disk) -> Result<Option<String>> {
        Ok(None)
    }

    /// Last modification time of the filesystem, Unix seconds.
    fn mtime(&self, _disk: &mut Disk) -> Result<Option<i64>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct FsRegistry {
    drivers: Vec<Box<dyn FsDriver>>,
}

impl FsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `driver` to the probe order, replacing any driver of the same
    /// name.
    pub fn register(&mut self, driver: Box<dyn FsDriver>) {
        self.unregister(driver.name());
        debug!("registering filesystem `{}'", driver.name());
        self.drivers.push(driver);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.drivers.len();
        self.drivers.retain(|d| d.name() != name);
        before != self.drivers.len()
    }

    /// Find the first driver, in registration order, that can list the root
    /// directory of `disk`.
    pub fn probe(&self, disk: &mut Disk) -> Result<&dyn FsDriver> {
        for driver in &self.drivers {
            match driver.dir(disk, "/", &mut |_, _| true) {
                Ok(()) => {
                    debug!("`{}' is {}", disk.name(), driver.name());
                    return Ok(driver.as_ref());
                }
                Err(e) if e.is_probe_recoverable() => {
                    debug!("{} rejected `{}': {e}", driver.name(), disk.name());
                }
                Err(e) => {
                    warn!("probing `{}' with {} failed: {e}", disk.name(), driver.name());
                    return Err(VfsError::UnknownFilesystem);
                }
            }
        }
        Err(VfsError::UnknownFilesystem)
    }
}

/// Split an absolute path into its non-empty components.
pub(crate) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::memdisk::{MemDiskDriver, MemDiskTable};
    use crate::disk::{DiskDriver, DiskRegistry};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Accepts(&'static str, Option<fn() -> VfsError>);

    impl FsDriver for Accepts {
        fn name(&self) -> &'static str { self.0 }
        fn dir(&self, _: &mut Disk, _: &str, hook: &mut DirHook<'_>) -> Result<()> {
            if let Some(make) = self.1 {
                return Err(make());
            }
            hook("entry", &DirInfo::default());
            Ok(())
        }
        fn open(&self, _: Disk, path: &str) -> Result<File> {
            Err(VfsError::FileNotFound(path.into()))
        }
    }

    fn bad_fs() -> VfsError { VfsError::BadFs("no".into()) }
    fn read_error() -> VfsError { VfsError::Read("io".into()) }
    fn out_of_range() -> VfsError { VfsError::OutOfRange("x".into()) }

    fn disk() -> Disk {
        let table = Rc::new(RefCell::new(MemDiskTable::default()));
        table.borrow_mut().add("m", vec![0; 1024]).unwrap();
        MemDiskDriver::new(table).open("m", &DiskRegistry::new()).unwrap()
    }

    #[test]
    fn first_registered_match_wins() {
        let mut reg = FsRegistry::new();
        reg.register(Box::new(Accepts("bad", Some(bad_fs))));
        reg.register(Box::new(Accepts("first", None)));
        reg.register(Box::new(Accepts("second", None)));
        let mut d = disk();
        for _ in 0..3 {
            assert_eq!(reg.probe(&mut d).unwrap().name(), "first");
        }
    }

    #[test]
    fn hard_error_stops_probe() {
        let mut reg = FsRegistry::new();
        reg.register(Box::new(Accepts("broken", Some(read_error))));
        reg.register(Box::new(Accepts("never", None)));
        assert!(matches!(reg.probe(&mut disk()), Err(VfsError::UnknownFilesystem)));
    }

    #[test]
    fn out_of_range_is_recoverable() {
        let mut reg = FsRegistry::new();
        reg.register(Box::new(Accepts("short", Some(out_of_range))));
        assert!(matches!(reg.probe(&mut disk()), Err(VfsError::UnknownFilesystem)));
        reg.register(Box::new(Accepts("ok", None)));
        assert_eq!(reg.probe(&mut disk()).unwrap().name(), "ok");
    }
}
