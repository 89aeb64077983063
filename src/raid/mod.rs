//! RAID5/RAID6 arrays assembled from named member devices.
//!
//! An array is described by a [`RaidArray`] and registered in a shared
//! [`RaidTable`].  Opening the array opens every member through the disk
//! registry; members that are absent or fail to open are tolerated up to
//! the parity count.  Reads map logical sectors onto members and rebuild a
//! member's chunk from parity when its read fails.
//!
//! # Geometry
//! Logical sectors are split into chunks of `chunk_sectors`; consecutive
//! chunks fill the data slots of a row, one row per chunk-sized band of
//! every member.  The parity member of row `r` is `r % n` for right layouts
//! and `n - 1 - r % n` for left layouts; RAID6 puts Q right after P.
//! Symmetric layouts start the data slots after the parity, asymmetric ones
//! keep them in member order.

pub mod recovery;

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use self::recovery::Member;
use crate::disk::{Disk, DiskDriver, DiskIo, DiskRegistry, PullClass, SECTOR_SIZE};
use crate::error::{zeroed_buf, Result, VfsError};

pub const DRIVER_NAME: &str = "diskfilter";

/// 64 KiB, the md default.
pub const DEFAULT_CHUNK_SECTORS: u64 = 128;

// ── Array description ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    Raid5,
    Raid6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RaidLayout {
    LeftAsymmetric,
    RightAsymmetric,
    #[default]
    LeftSymmetric,
    RightSymmetric,
}

impl RaidLayout {
    fn is_right(self) -> bool {
        matches!(self, RaidLayout::RightAsymmetric | RaidLayout::RightSymmetric)
    }

    fn is_symmetric(self) -> bool {
        matches!(self, RaidLayout::LeftSymmetric | RaidLayout::RightSymmetric)
    }
}

fn default_chunk_sectors() -> u64 {
    DEFAULT_CHUNK_SECTORS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidArray {
    pub name:           String,
    pub level:          RaidLevel,
    #[serde(default)]
    pub layout:         RaidLayout,
    #[serde(default = "default_chunk_sectors")]
    pub chunk_sectors:  u64,
    /// Member device names in slot order; `None` for a missing member.
    pub members:        Vec<Option<String>>,
    /// Sectors used on every member.  Defaults to the smallest member.
    #[serde(default)]
    pub member_sectors: Option<u64>,
}

/// Where one logical sector lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    /// Member slot holding the data.
    pub disk:   usize,
    /// Sector on that member.
    pub sector: u64,
    /// Sectors left in the chunk, this one included.
    pub run:    u64,
    pub p:      usize,
    pub q:      Option<usize>,
}

impl RaidArray {
    pub fn new(name: impl Into<String>, level: RaidLevel, members: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            level,
            layout: RaidLayout::default(),
            chunk_sectors: DEFAULT_CHUNK_SECTORS,
            members,
            member_sectors: None,
        }
    }

    pub fn parity_count(&self) -> usize {
        match self.level {
            RaidLevel::Raid5 => 1,
            RaidLevel::Raid6 => 2,
        }
    }

    pub fn data_count(&self) -> usize {
        self.members.len() - self.parity_count()
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.members.len();
        let min = self.parity_count() + 2;
        if n < min || n > 255 {
            return Err(VfsError::BadDevice(format!(
                "array `{}' needs {min}..=255 members, has {n}", self.name
            )));
        }
        if self.chunk_sectors == 0 {
            return Err(VfsError::BadDevice(format!("array `{}' has a zero chunk size", self.name)));
        }
        if self.members.iter().flatten().any(|m| *m == self.name) {
            return Err(VfsError::BadDevice(format!("array `{}' contains itself", self.name)));
        }
        Ok(())
    }

    /// Parity slots of `row`.
    pub(crate) fn parity_disks(&self, row: u64) -> (usize, Option<usize>) {
        let n = self.members.len() as u64;
        let mut p = row % n;
        if !self.layout.is_right() {
            p = n - 1 - p;
        }
        let q = (self.level == RaidLevel::Raid6).then(|| ((p + 1) % n) as usize);
        (p as usize, q)
    }

    pub(crate) fn locate(&self, sector: u64) -> Location {
        let n = self.members.len() as u64;
        let np = self.parity_count() as u64;
        let chunk = self.chunk_sectors;

        let within = sector % chunk;
        let stripe = sector / chunk;
        let row = stripe / (n - np);
        let mut disknr = stripe % (n - np);
        let (p, q) = self.parity_disks(row);
        let pp = p as u64;

        if self.layout.is_symmetric() {
            disknr += pp + np;
        } else {
            let last = (pp + np - 1) % n;
            if disknr >= pp {
                disknr += np;
            } else if disknr >= last {
                disknr += last + 1;
            }
        }

        Location {
            disk: (disknr % n) as usize,
            sector: row * chunk + within,
            run: chunk - within,
            p,
            q,
        }
    }

    /// Lay `data` out over fresh member images, computing parity.  The
    /// content is zero-padded to whole rows.
    pub fn stripe(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.validate()?;
        let n = self.members.len();
        let sector = SECTOR_SIZE as usize;
        let chunk_bytes = self.chunk_sectors as usize * sector;
        let row_bytes = chunk_bytes * self.data_count();
        let rows = data.len().div_ceil(row_bytes).max(1);

        let mut images = Vec::with_capacity(n);
        for _ in 0..n {
            images.push(zeroed_buf(rows * chunk_bytes)?);
        }

        for s in 0..(rows * row_bytes / sector) as u64 {
            let start = s as usize * sector;
            if start >= data.len() {
                break;
            }
            let src = &data[start..data.len().min(start + sector)];
            let loc = self.locate(s);
            let dst = loc.sector as usize * sector;
            images[loc.disk][dst..dst + src.len()].copy_from_slice(src);
        }

        for row in 0..rows {
            let band = row * chunk_bytes..(row + 1) * chunk_bytes;
            let (p, q) = self.parity_disks(row as u64);
            let (pv, qv) = {
                let order = data_order(n, p, q);
                let stripes: Vec<&[u8]> = order.iter().map(|&i| &images[i][band.clone()]).collect();
                recovery::syndromes(&stripes)
            };
            images[p][band.clone()].copy_from_slice(&pv);
            if let Some(q) = q {
                images[q][band].copy_from_slice(&qv);
            }
        }
        Ok(images)
    }
}

/// Data slots of a row in parity order: RAID6 counts from the slot after Q,
/// RAID5 from the slot after P.
fn data_order(n: usize, p: usize, q: Option<usize>) -> Vec<usize> {
    let start = q.unwrap_or(p) + 1;
    (0..n)
        .map(|k| (start + k) % n)
        .filter(|&i| i != p && Some(i) != q)
        .collect()
}

// ── Registration table ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RaidTable {
    arrays:  Vec<(RaidArray, u64)>,
    next_id: u64,
}

pub type SharedRaid = Rc<RefCell<RaidTable>>;

impl RaidTable {
    pub fn add(&mut self, array: RaidArray) -> Result<u64> {
        array.validate()?;
        if self.arrays.iter().any(|(a, _)| a.name == array.name) {
            return Err(VfsError::BadDevice(format!("device name `{}' already exists", array.name)));
        }
        self.check_nesting(&array)?;
        let id = self.next_id;
        self.next_id += 1;
        debug!("raid `{}' registered with {} member(s)", array.name, array.members.len());
        self.arrays.push((array, id));
        Ok(id)
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let before = self.arrays.len();
        self.arrays.retain(|(a, _)| a.name != name);
        if before == self.arrays.len() {
            return Err(VfsError::BadDevice(format!("device `{name}' not found")));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RaidArray> {
        self.arrays.iter().find(|(a, _)| a.name == name).map(|(a, _)| a)
    }

    /// Whether `target` is `from` or an array somewhere beneath it.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut pending = vec![from];
        let mut seen: Vec<&str> = Vec::new();
        while let Some(name) = pending.pop() {
            if name == target {
                return true;
            }
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            if let Some(array) = self.get(name) {
                pending.extend(array.members.iter().flatten().map(String::as_str));
            }
        }
        false
    }

    /// Reject `array` when one of its members is, or is built from, the
    /// array itself.
    pub fn check_nesting(&self, array: &RaidArray) -> Result<()> {
        match array.members.iter().flatten().find(|m| self.reaches(m, &array.name)) {
            Some(m) => Err(VfsError::BadDevice(format!(
                "array `{}' would contain itself through `{m}'", array.name
            ))),
            None => Ok(()),
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct RaidDriver {
    table: SharedRaid,
}

impl RaidDriver {
    pub fn new(table: SharedRaid) -> Self {
        Self { table }
    }
}

impl DiskDriver for RaidDriver {
    fn name(&self) -> &'static str { DRIVER_NAME }

    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool, pull: PullClass) -> bool {
        if pull != PullClass::None {
            return false;
        }
        let names: Vec<String> = self.table.borrow().arrays.iter().map(|(a, _)| a.name.clone()).collect();
        names.iter().any(|n| hook(n.as_str()))
    }

    fn open(&self, name: &str, disks: &DiskRegistry) -> Result<Disk> {
        let (array, id) = {
            let table = self.table.borrow();
            let entry = table
                .arrays
                .iter()
                .find(|(a, _)| a.name == name)
                .cloned()
                .ok_or_else(|| VfsError::UnknownDevice(name.to_string()))?;
            table.check_nesting(&entry.0)?;
            entry
        };
        let mut members = Vec::with_capacity(array.members.len());
        for (slot, member) in array.members.iter().enumerate() {
            let disk = match member {
                Some(m) => match disks.open(m) {
                    Ok(d) => Some(d),
                    Err(e) => {
                        warn!("{name}: member {slot} (`{m}') unavailable: {e}");
                        None
                    }
                },
                None => {
                    warn!("{name}: member {slot} is missing");
                    None
                }
            };
            members.push(disk);
        }

        let missing = members.iter().filter(|m| m.is_none()).count();
        if missing > array.parity_count() {
            return Err(VfsError::TooManyBadDevices);
        }

        let member_sectors = match array.member_sectors {
            Some(s) => s,
            None => members
                .iter()
                .flatten()
                .map(|d| d.total_sectors())
                .min()
                .flatten()
                .ok_or_else(|| VfsError::BadDevice(format!("cannot size members of `{name}'")))?,
        };
        let rows = member_sectors / array.chunk_sectors;
        let total = rows * array.chunk_sectors * array.data_count() as u64;
        debug!("{name}: {:?} over {} member(s), {total} sectors", array.level, members.len());

        let io = RaidIo { array, members };
        Ok(Disk::new(name, DRIVER_NAME, id, Some(total), Box::new(io)))
    }
}

struct RaidIo {
    array:   RaidArray,
    members: Vec<Option<Disk>>,
}

fn read_member(members: &mut [Option<Disk>], slot: usize, sector: u64, buf: &mut [u8]) -> Result<()> {
    match members.get_mut(slot).and_then(Option::as_mut) {
        Some(disk) => disk.read(sector, 0, buf),
        None => Err(VfsError::UnknownDevice(format!("member {slot}"))),
    }
}

impl RaidIo {
    fn read_chunk(&mut self, loc: &Location, buf: &mut [u8]) -> Result<()> {
        match read_member(&mut self.members, loc.disk, loc.sector, buf) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_member_failure() => {
                warn!("{}: member {} failed at sector {}, rebuilding: {e}", self.array.name, loc.disk, loc.sector);
            }
            Err(e) => return Err(e),
        }

        let n = self.array.members.len();
        let members = &mut self.members;
        match loc.q {
            None => {
                let mut tmp = zeroed_buf(buf.len())?;
                buf.fill(0);
                for slot in (0..n).filter(|&s| s != loc.disk) {
                    read_member(members, slot, loc.sector, &mut tmp)
                        .map_err(|_| VfsError::TooManyBadDevices)?;
                    for (d, s) in buf.iter_mut().zip(&tmp) {
                        *d ^= s;
                    }
                }
                Ok(())
            }
            Some(q) => {
                let order = data_order(n, loc.p, Some(q));
                let bad = order
                    .iter()
                    .position(|&s| s == loc.disk)
                    .ok_or_else(|| VfsError::BadDevice("data slot maps onto parity".into()))?;
                let p = loc.p;
                recovery::recover(order.len(), bad, buf, &mut |member, out| {
                    let slot = match member {
                        Member::Data(j) => order[j],
                        Member::P => p,
                        Member::Q => q,
                    };
                    read_member(members, slot, loc.sector, out)
                })
            }
        }
    }
}

impl DiskIo for RaidIo {
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let mut sector = sector;
        let mut done = 0usize;
        while done < buf.len() {
            let loc = self.array.locate(sector);
            let left = ((buf.len() - done) as u64) / SECTOR_SIZE;
            let count = loc.run.min(left);
            let len = (count * SECTOR_SIZE) as usize;
            self.read_chunk(&loc, &mut buf[done..done + len])?;
            done += len;
            sector += count;
        }
        Ok(())
    }
}
