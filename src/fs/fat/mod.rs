//! Read-only FAT12/16/32 driver.
//!
//! Every call re-reads the boot sector; the driver itself holds no state.
//! Files resolve their cluster chain at open and read clusters directly
//! afterwards.

pub mod bpb;
pub mod dir_entry;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use self::bpb::{Bpb, FatType, BOOT_SECTOR_SIZE};
use self::dir_entry::DirEntry;
use super::{components, DirHook, DirInfo, FsDriver};
use crate::disk::Disk;
use crate::error::{zeroed_buf, Result, VfsError};
use crate::file::{File, FileSource};

pub struct FatFs;

/// Where a directory's entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirLoc {
    /// The fixed root directory region of FAT12/16.
    FixedRoot,
    Chain(u32),
}

struct Volume {
    bpb: Bpb,
}

impl Volume {
    fn mount(disk: &mut Disk) -> Result<Self> {
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        disk.read(0, 0, &mut sector)?;
        let bpb = Bpb::parse(&sector)?;
        debug!("fat: {} volume, {} cluster(s)", bpb.fat_type, bpb.cluster_count);
        Ok(Self { bpb })
    }

    fn root(&self) -> DirLoc {
        match self.bpb.fat_type {
            FatType::Fat32 => DirLoc::Chain(self.bpb.root_clus),
            _ => DirLoc::FixedRoot,
        }
    }

    /// FAT entry for `cluster`.
    fn fat_entry(&self, disk: &mut Disk, cluster: u32) -> Result<u32> {
        let base = self.bpb.fat_offset();
        let c = u64::from(cluster);
        match self.bpb.fat_type {
            FatType::Fat12 => {
                let mut b = [0u8; 2];
                disk.read(0, base + c + c / 2, &mut b)?;
                let v = u32::from(LittleEndian::read_u16(&b));
                Ok(if cluster & 1 == 1 { v >> 4 } else { v & 0x0FFF })
            }
            FatType::Fat16 => {
                let mut b = [0u8; 2];
                disk.read(0, base + c * 2, &mut b)?;
                Ok(u32::from(LittleEndian::read_u16(&b)))
            }
            FatType::Fat32 => {
                let mut b = [0u8; 4];
                disk.read(0, base + c * 4, &mut b)?;
                Ok(LittleEndian::read_u32(&b) & 0x0FFF_FFFF)
            }
        }
    }

    /// Follow the chain starting at `first`.  Cluster 0 is the empty chain.
    fn chain(&self, disk: &mut Disk, first: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        if first == 0 {
            return Ok(clusters);
        }
        let eoc = self.bpb.fat_type.eoc();
        let mut cluster = first;
        loop {
            if !self.bpb.is_valid_cluster(cluster) || cluster == self.bpb.fat_type.bad() {
                return Err(VfsError::BadFs(format!("invalid cluster {cluster} in chain")));
            }
            if clusters.len() as u64 > u64::from(self.bpb.cluster_count) {
                return Err(VfsError::BadFs("cluster chain loops".into()));
            }
            clusters.push(cluster);
            let next = self.fat_entry(disk, cluster)?;
            if next >= eoc {
                return Ok(clusters);
            }
            cluster = next;
        }
    }

    fn read_dir(&self, disk: &mut Disk, loc: DirLoc) -> Result<Vec<u8>> {
        match loc {
            DirLoc::FixedRoot => {
                let mut data = zeroed_buf(self.bpb.root_dir_size() as usize)?;
                disk.read(0, self.bpb.root_dir_offset(), &mut data)?;
                Ok(data)
            }
            DirLoc::Chain(first) => {
                let clusters = self.chain(disk, first)?;
                let cs = self.bpb.cluster_size() as usize;
                let mut data = zeroed_buf(clusters.len() * cs)?;
                for (chunk, &c) in data.chunks_mut(cs).zip(&clusters) {
                    disk.read(0, self.bpb.cluster_offset(c), chunk)?;
                }
                Ok(data)
            }
        }
    }

    /// Directory location an entry points at; `..` of a first-level
    /// directory stores cluster 0 for the root.
    fn dir_of(&self, entry: &DirEntry) -> DirLoc {
        match entry.short.first_clus {
            0 => self.root(),
            c => DirLoc::Chain(c),
        }
    }

    fn find(&self, disk: &mut Disk, loc: DirLoc, name: &str) -> Result<Option<DirEntry>> {
        let data = self.read_dir(disk, loc)?;
        let mut found = None;
        dir_entry::walk(&data, |entry| {
            if entry.short.is_volume_label() {
                return false;
            }
            if entry.name.eq_ignore_ascii_case(name) || entry.short.short_name().eq_ignore_ascii_case(name) {
                found = Some(entry);
                return true;
            }
            false
        });
        Ok(found)
    }

    /// The volume-label entry of the root directory, if any.
    fn label_entry(&self, disk: &mut Disk) -> Result<Option<DirEntry>> {
        let data = self.read_dir(disk, self.root())?;
        let mut label = None;
        dir_entry::walk(&data, |entry| {
            if entry.short.is_volume_label() && !entry.short.is_dir() {
                label = Some(entry);
                return true;
            }
            false
        });
        Ok(label)
    }

    /// Resolve `path`.  `None` means the root directory.
    fn lookup(&self, disk: &mut Disk, path: &str) -> Result<Option<DirEntry>> {
        let mut loc = self.root();
        let mut current: Option<DirEntry> = None;
        for part in components(path) {
            if let Some(entry) = &current {
                if !entry.short.is_dir() {
                    return Err(VfsError::NotADirectory(path.to_string()));
                }
                loc = self.dir_of(entry);
            }
            let entry = self
                .find(disk, loc, part)?
                .ok_or_else(|| VfsError::FileNotFound(path.to_string()))?;
            current = (!(entry.short.is_dir() && entry.short.first_clus == 0)).then_some(entry);
            if current.is_none() {
                loc = self.root();
            }
        }
        Ok(current)
    }
}

impl FsDriver for FatFs {
    fn name(&self) -> &'static str { "fat" }

    fn dir(&self, disk: &mut Disk, path: &str, hook: &mut DirHook<'_>) -> Result<()> {
        let vol = Volume::mount(disk)?;
        let loc = match vol.lookup(disk, path)? {
            None => vol.root(),
            Some(entry) if entry.short.is_dir() => vol.dir_of(&entry),
            Some(_) => return Err(VfsError::NotADirectory(path.to_string())),
        };
        let data = vol.read_dir(disk, loc)?;
        dir_entry::walk(&data, |entry| {
            if entry.short.is_volume_label() || entry.short.is_dot() {
                return false;
            }
            let info = DirInfo {
                is_dir: entry.short.is_dir(),
                size:   (!entry.short.is_dir()).then_some(u64::from(entry.short.file_size)),
                mtime:  entry.short.mtime(),
            };
            hook(&entry.name, &info)
        });
        Ok(())
    }

    fn open(&self, mut disk: Disk, path: &str) -> Result<File> {
        let vol = Volume::mount(&mut disk)?;
        let entry = match vol.lookup(&mut disk, path)? {
            Some(entry) if !entry.short.is_dir() => entry,
            _ => return Err(VfsError::BadFs(format!("`{path}' is a directory"))),
        };
        let size = u64::from(entry.short.file_size);
        let clusters = vol.chain(&mut disk, entry.short.first_clus)?;
        if (clusters.len() as u64) * vol.bpb.cluster_size() < size {
            return Err(VfsError::BadFs(format!("cluster chain of `{path}' is too short")));
        }
        debug!("fat: `{path}' is {size} bytes in {} cluster(s)", clusters.len());
        let source = FatFileSource { disk, bpb: vol.bpb, clusters };
        Ok(File::new(Box::new(source), Some(size)))
    }

    fn label(&self, disk: &mut Disk) -> Result<Option<String>> {
        let vol = Volume::mount(disk)?;
        let label = vol.label_entry(disk)?.map(|entry| entry.short.label());
        Ok(label.or_else(|| vol.bpb.label()))
    }

    /// Write time of the root volume-label entry.
    fn mtime(&self, disk: &mut Disk) -> Result<Option<i64>> {
        let vol = Volume::mount(disk)?;
        Ok(vol.label_entry(disk)?.and_then(|entry| entry.short.mtime()))
    }

    fn uuid(&self, disk: &mut Disk) -> Result<Option<String>> {
        let vol = Volume::mount(disk)?;
        Ok(vol.bpb.vol_id.map(|id| format!("{:04x}-{:04x}", id >> 16, id & 0xFFFF)))
    }
}

struct FatFileSource {
    disk:     Disk,
    bpb:      Bpb,
    clusters: Vec<u32>,
}

impl FileSource for FatFileSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let cs = self.bpb.cluster_size();
        let mut done = 0usize;
        let mut pos = offset;
        while done < buf.len() {
            let Some(&cluster) = self.clusters.get((pos / cs) as usize) else { break };
            let within = pos % cs;
            let n = ((cs - within) as usize).min(buf.len() - done);
            self.disk
                .read(0, self.bpb.cluster_offset(cluster) + within, &mut buf[done..done + n])?;
            done += n;
            pos += n as u64;
        }
        Ok(done)
    }
}
