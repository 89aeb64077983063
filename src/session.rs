//! The session: every registry and name table in one owned value.
//!
//! A [`Session`] holds the disk drivers, filesystem drivers, stream filters
//! and the loopback / memdisk / RAID tables those drivers read.  Hosts build
//! one per process (or one per test) and call the entry points on it; there
//! is no global state.  Nothing here is `Sync`: a host sharing a session
//! between threads serialises access itself.
//!
//! # Example
//! ```no_run
//! use diskview::{FileType, Session};
//!
//! let session = Session::new();
//! session.loopback_add("ld0", "/images/disk.img.zst", true)?;
//! let mut file = session.file_open("(ld0)/boot/config.txt", FileType::NONE)?;
//! let mut buf = vec![0u8; 4096];
//! let n = file.read(&mut buf)?;
//! # Ok::<(), diskview::VfsError>(())
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use crate::config::SessionConfig;
use crate::disk::host::{HostDiskDriver, HostRootDriver, HOST_DEVICE};
use crate::disk::loopback::{LoopbackDriver, LoopbackTable, SharedLoopbacks};
use crate::disk::memdisk::{MemDiskDriver, MemDiskTable, SharedMemDisks};
use crate::disk::{Disk, DiskDriver, DiskRegistry, PullClass};
use crate::error::{Result, VfsError};
use crate::file::{split_name, File, FileType};
use crate::filter::{self, StreamFilter};
use crate::fs::fat::FatFs;
use crate::fs::hostfs::HostFs;
use crate::fs::{blocklist, DirHook, FsDriver, FsRegistry};
use crate::raid::{RaidArray, RaidDriver, RaidTable, SharedRaid};

/// Filesystem identity as reported by [`Session::probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub fs:    &'static str,
    pub label: Option<String>,
    pub uuid:  Option<String>,
    pub mtime: Option<i64>,
}

pub struct Session {
    disks:       DiskRegistry,
    filesystems: FsRegistry,
    filters:     Vec<Box<dyn StreamFilter>>,
    loopbacks:   SharedLoopbacks,
    memdisks:    SharedMemDisks,
    raid:        SharedRaid,
    root:        Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with no drivers, filesystems or filters.  The name tables
    /// exist but nothing reads them until drivers are registered.
    pub fn empty() -> Self {
        Self {
            disks:       DiskRegistry::new(),
            filesystems: FsRegistry::new(),
            filters:     Vec::new(),
            loopbacks:   Rc::new(RefCell::new(LoopbackTable::default())),
            memdisks:    Rc::new(RefCell::new(MemDiskTable::default())),
            raid:        Rc::new(RefCell::new(RaidTable::default())),
            root:        None,
        }
    }

    /// The standard stack without host drives.
    ///
    /// Disk drivers: loopback, memdisk, diskfilter, host, hostdisk.
    /// Filesystems: fat, hostfs.  Filters: lz4, zstd.
    pub fn new() -> Self {
        Self::with_host_disks(Vec::new())
    }

    fn with_host_disks(host_disks: Vec<std::path::PathBuf>) -> Self {
        let mut session = Self::empty();
        session.register_disk_driver(Box::new(LoopbackDriver::new(Rc::clone(&session.loopbacks))));
        session.register_disk_driver(Box::new(MemDiskDriver::new(Rc::clone(&session.memdisks))));
        session.register_disk_driver(Box::new(RaidDriver::new(Rc::clone(&session.raid))));
        session.register_disk_driver(Box::new(HostRootDriver));
        session.register_disk_driver(Box::new(HostDiskDriver::new(host_disks)));
        session.register_filesystem(Box::new(FatFs));
        session.register_filesystem(Box::new(HostFs));
        session.filters = filter::default_filters();
        session
    }

    /// Build the standard stack, then mount and assemble what `config`
    /// lists, in order.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let mut host_disks = config.host_disks.clone();
        if config.discover_host_disks {
            host_disks.extend(HostDiskDriver::discover());
        }
        let mut session = Self::with_host_disks(host_disks);
        for lb in &config.loopbacks {
            session.loopback_add(&lb.name, &lb.path, lb.decompress)?;
        }
        for array in &config.raid {
            session.raid_add(array.clone())?;
        }
        session.root = config.root.clone();
        info!(
            "session ready: {} loopback(s), {} array(s)",
            config.loopbacks.len(),
            config.raid.len()
        );
        Ok(session)
    }

    // ── Registration ─────────────────────────────────────────────────────────

    pub fn register_disk_driver(&mut self, driver: Box<dyn DiskDriver>) {
        self.disks.register(driver);
    }

    pub fn unregister_disk_driver(&mut self, name: &str) -> bool {
        self.disks.unregister(name)
    }

    pub fn register_filesystem(&mut self, driver: Box<dyn FsDriver>) {
        self.filesystems.register(driver);
    }

    pub fn unregister_filesystem(&mut self, name: &str) -> bool {
        self.filesystems.unregister(name)
    }

    /// Append a stream filter to the end of the chain.
    pub fn register_filter(&mut self, filter: Box<dyn StreamFilter>) {
        self.filters.retain(|f| f.name() != filter.name());
        self.filters.push(filter);
    }

    pub fn disks(&self) -> &DiskRegistry { &self.disks }
    pub fn filesystems(&self) -> &FsRegistry { &self.filesystems }

    pub fn root(&self) -> Option<&str> { self.root.as_deref() }

    /// Device used for names that carry no `(device)` part.
    pub fn set_root(&mut self, device: Option<String>) {
        self.root = device;
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    /// Call `hook` with every device name for `pull`.  Returns `true` when
    /// the hook stopped the walk.
    pub fn device_iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
        self.disks.iterate(hook, pull)
    }

    pub fn device_open(&self, name: &str) -> Result<Disk> {
        self.disks.open(name)
    }

    pub fn device_close(&self, disk: Disk) {
        disk.close();
    }

    // ── Filesystems ──────────────────────────────────────────────────────────

    /// The first registered filesystem driver that recognises `disk`.
    pub fn fs_probe(&self, disk: &mut Disk) -> Result<&dyn FsDriver> {
        self.filesystems.probe(disk)
    }

    /// Probe `device` and collect its label, UUID and modification time.
    pub fn probe(&self, device: &str) -> Result<FsInfo> {
        let mut disk = self.device_open(device)?;
        let fs = self.fs_probe(&mut disk)?;
        Ok(FsInfo {
            fs:    fs.name(),
            label: fs.label(&mut disk)?,
            uuid:  fs.uuid(&mut disk)?,
            mtime: fs.mtime(&mut disk)?,
        })
    }

    /// List the directory named `(device)/path`.  The hook returns `true`
    /// to stop.
    pub fn dir(&self, name: &str, hook: &mut DirHook<'_>) -> Result<()> {
        let (device, path) = self.resolve(name)?;
        if !path.starts_with('/') {
            return Err(VfsError::BadFilename(name.to_string()));
        }
        let mut disk = self.device_open(device)?;
        let fs = self.fs_probe(&mut disk)?;
        fs.dir(&mut disk, path, hook)
    }

    // ── Files ────────────────────────────────────────────────────────────────

    /// Open `(device)/path` through its filesystem, or `(device)blocklist`
    /// as a raw sector view, then run the result through the filter chain.
    pub fn file_open(&self, name: &str, file_type: FileType) -> Result<File> {
        let (device, path) = self.resolve(name)?;
        let mut disk = self.device_open(device)?;

        let mut file = if path.starts_with('/') {
            let fs = self.fs_probe(&mut disk)?;
            fs.open(disk, path)?
        } else {
            blocklist::open(disk, path)?
        };
        file.set_name(name);
        file.set_file_type(file_type);
        filter::apply(&self.filters, file, file_type)
    }

    fn resolve<'a>(&'a self, name: &'a str) -> Result<(&'a str, &'a str)> {
        let (device, path) = split_name(name)?;
        match device.or(self.root.as_deref()) {
            Some(device) => Ok((device, path)),
            None => Err(VfsError::BadDevice(format!("no device given for `{name}'"))),
        }
    }

    // ── Loopback ─────────────────────────────────────────────────────────────

    /// Mount `path` as the loopback device `name`.
    ///
    /// `path` is a VFS name, or a host path which is opened on `(host)`.
    /// The image goes through the filter chain unless `decompress` is false.
    pub fn loopback_add(&self, name: &str, path: &str, decompress: bool) -> Result<u64> {
        if self.loopbacks.borrow().contains(name) {
            return Err(VfsError::BadDevice(format!("device name `{name}' already exists")));
        }
        let source = if path.starts_with('(') { path.to_string() } else { host_name(path)? };

        let mut file_type = FileType::LOOPBACK;
        if !decompress {
            file_type |= FileType::NO_DECOMPRESS;
        }
        let file = self.file_open(&source, file_type)?;
        debug!("loopback `{name}' backed by `{source}' ({:?} bytes)", file.size());
        self.loopbacks.borrow_mut().add(name, file, decompress)
    }

    pub fn loopback_delete(&self, name: &str) -> Result<()> {
        self.loopbacks.borrow_mut().delete(name)
    }

    /// `(name, id, decompress)` for every mounted loopback.
    pub fn loopback_list(&self) -> Vec<(String, u64, bool)> {
        self.loopbacks.borrow().list()
    }

    // ── Memory disks and arrays ──────────────────────────────────────────────

    pub fn memdisk_add(&self, name: &str, data: Vec<u8>) -> Result<u64> {
        self.memdisks.borrow_mut().add(name, data)
    }

    pub fn memdisk_remove(&self, name: &str) -> Result<()> {
        self.memdisks.borrow_mut().remove(name)
    }

    pub fn raid_add(&self, array: RaidArray) -> Result<u64> {
        self.raid.borrow_mut().add(array)
    }

    pub fn raid_remove(&self, name: &str) -> Result<()> {
        self.raid.borrow_mut().remove(name)
    }
}

/// `(host)/<absolute path>` for a host path.
fn host_name(path: &str) -> Result<String> {
    let abs = std::path::absolute(path)?;
    let abs = abs
        .to_str()
        .ok_or_else(|| VfsError::BadFilename(path.to_string()))?;
    if abs.starts_with('/') {
        Ok(format!("({HOST_DEVICE}){abs}"))
    } else {
        Ok(format!("({HOST_DEVICE})/{abs}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::tests::fat12_image;

    #[test]
    fn names_need_a_device() {
        let session = Session::new();
        assert!(matches!(session.file_open("/x", FileType::NONE), Err(VfsError::BadDevice(_))));
        assert!(matches!(session.file_open("(nope)/x", FileType::NONE), Err(VfsError::UnknownDevice(_))));
        assert!(matches!(session.file_open("(m/x", FileType::NONE), Err(VfsError::BadFilename(_))));
    }

    #[test]
    fn root_device_fills_in() {
        let mut session = Session::new();
        session.memdisk_add("m", fat12_image()).unwrap();
        session.set_root(Some("m".into()));
        let f = session.file_open("/HELLO.TXT", FileType::NONE).unwrap();
        assert_eq!(f.size(), Some(600));
        assert_eq!(f.name(), "/HELLO.TXT");
        let raw = session.file_open("0+1", FileType::NONE).unwrap();
        assert_eq!(raw.size(), Some(512));
    }

    #[test]
    fn probe_reports_fat_metadata() {
        let session = Session::new();
        session.memdisk_add("m", fat12_image()).unwrap();
        let info = session.probe("m").unwrap();
        assert_eq!(info.fs, "fat");
        assert_eq!(info.label.as_deref(), Some("TESTVOL"));
        assert_eq!(info.uuid.as_deref(), Some("1234-abcd"));
        // 2021-03-04 08:15:00 UTC, from the label entry.
        assert_eq!(info.mtime, Some(1_614_845_700));
    }

    #[test]
    fn dir_lists_and_rejects_blocklists() {
        let session = Session::new();
        session.memdisk_add("m", fat12_image()).unwrap();
        let mut names = Vec::new();
        session
            .dir("(m)/SUB", &mut |name, _| {
                names.push(name.to_string());
                false
            })
            .unwrap();
        assert_eq!(names, ["Long File Name.txt"]);
        assert!(matches!(session.dir("(m)0+1", &mut |_, _| false), Err(VfsError::BadFilename(_))));
    }

    #[test]
    fn empty_session_knows_no_devices() {
        let session = Session::empty();
        session.memdisk_add("m", vec![0; 512]).unwrap();
        assert!(matches!(session.device_open("m"), Err(VfsError::UnknownDevice(_))));
        assert!(!session.device_iterate(&mut |_| true, PullClass::None));
    }

    #[test]
    fn filter_registration_replaces_by_name() {
        let mut session = Session::new();
        session.register_filter(Box::new(crate::filter::lz4::Lz4Filter));
        let names: Vec<_> = session.filters.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["zstd", "lz4"]);
    }
}
