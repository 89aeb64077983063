//! BIOS parameter block parsing and FAT type detection.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Result, VfsError};

pub const BOOT_SECTOR_SIZE: usize = 512;

const VALID_BYTES_PER_SEC: [u16; 4] = [512, 1024, 2048, 4096];
const EXTENDED_BOOT_SIG: u8 = 0x29;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Chain values at or above this mark the end of a chain.
    pub fn eoc(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// The bad-cluster marker.
    pub fn bad(self) -> u32 {
        self.eoc() - 1
    }
}

impl std::fmt::Display for FatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Bpb {
    pub bytes_per_sec: u16,
    pub sec_per_clus:  u8,
    pub rsvd_sec_cnt:  u16,
    pub num_fat:       u8,
    pub root_ent_cnt:  u16,
    pub tot_sec:       u32,
    pub fat_sz:        u32,
    /// First cluster of the root directory (FAT32 only).
    pub root_clus:     u32,
    pub vol_id:        Option<u32>,
    pub vol_lab:       Option<[u8; 11]>,
    pub fat_type:      FatType,
    pub cluster_count: u32,
}

fn reject(what: &str) -> VfsError {
    VfsError::BadFs(format!("not a FAT filesystem ({what})"))
}

impl Bpb {
    pub fn parse(sector: &[u8; BOOT_SECTOR_SIZE]) -> Result<Self> {
        if !((sector[0] == 0xEB && sector[2] == 0x90) || sector[0] == 0xE9) {
            return Err(reject("jump instruction"));
        }
        if sector[510..512] != [0x55, 0xAA] {
            return Err(reject("boot signature"));
        }

        let mut r = Cursor::new(&sector[..]);
        r.set_position(11);
        let bytes_per_sec = r.read_u16::<LittleEndian>()?;
        let sec_per_clus  = r.read_u8()?;
        let rsvd_sec_cnt  = r.read_u16::<LittleEndian>()?;
        let num_fat       = r.read_u8()?;
        let root_ent_cnt  = r.read_u16::<LittleEndian>()?;
        let tot_sec_16    = r.read_u16::<LittleEndian>()?;
        let _media        = r.read_u8()?;
        let fat_sz_16     = r.read_u16::<LittleEndian>()?;
        r.set_position(32);
        let tot_sec_32    = r.read_u32::<LittleEndian>()?;
        let fat_sz_32     = r.read_u32::<LittleEndian>()?;
        r.set_position(44);
        let root_clus     = r.read_u32::<LittleEndian>()?;

        if !VALID_BYTES_PER_SEC.contains(&bytes_per_sec) {
            return Err(reject("bytes per sector"));
        }
        if !sec_per_clus.is_power_of_two() {
            return Err(reject("sectors per cluster"));
        }
        if u32::from(bytes_per_sec) * u32::from(sec_per_clus) > 64 * 1024 {
            return Err(reject("cluster size"));
        }
        if rsvd_sec_cnt == 0 || num_fat == 0 {
            return Err(reject("reserved sectors or FAT count"));
        }

        let tot_sec = if tot_sec_16 != 0 { u32::from(tot_sec_16) } else { tot_sec_32 };
        let fat_sz = if fat_sz_16 != 0 { u32::from(fat_sz_16) } else { fat_sz_32 };
        if tot_sec == 0 || fat_sz == 0 {
            return Err(reject("zero-sized volume or FAT"));
        }

        let root_dir_sectors = (u32::from(root_ent_cnt) * 32).div_ceil(u32::from(bytes_per_sec));
        let meta = u64::from(rsvd_sec_cnt)
            + u64::from(num_fat) * u64::from(fat_sz)
            + u64::from(root_dir_sectors);
        let data_sec = u64::from(tot_sec)
            .checked_sub(meta)
            .ok_or_else(|| reject("layout exceeds volume"))?;
        let cluster_count = (data_sec / u64::from(sec_per_clus)) as u32;

        let fat_type = if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        match fat_type {
            FatType::Fat32 if root_ent_cnt != 0 || fat_sz_16 != 0 || root_clus < 2 => {
                return Err(reject("inconsistent FAT32 fields"));
            }
            FatType::Fat12 | FatType::Fat16 if root_ent_cnt == 0 => {
                return Err(reject("empty fixed root directory"));
            }
            _ => {}
        }

        let ext = if fat_type == FatType::Fat32 { 64 } else { 36 };
        let (vol_id, vol_lab) = if sector[ext + 2] == EXTENDED_BOOT_SIG {
            r.set_position(ext as u64 + 3);
            let id = r.read_u32::<LittleEndian>()?;
            let mut lab = [0u8; 11];
            lab.copy_from_slice(&sector[ext + 7..ext + 18]);
            (Some(id), Some(lab))
        } else {
            (None, None)
        };

        Ok(Self {
            bytes_per_sec,
            sec_per_clus,
            rsvd_sec_cnt,
            num_fat,
            root_ent_cnt,
            tot_sec,
            fat_sz,
            root_clus: if fat_type == FatType::Fat32 { root_clus } else { 0 },
            vol_id,
            vol_lab,
            fat_type,
            cluster_count,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        u64::from(self.bytes_per_sec) * u64::from(self.sec_per_clus)
    }

    /// Byte offset of the first FAT.
    pub fn fat_offset(&self) -> u64 {
        u64::from(self.rsvd_sec_cnt) * u64::from(self.bytes_per_sec)
    }

    /// Byte offset of the fixed root directory (FAT12/16).
    pub fn root_dir_offset(&self) -> u64 {
        self.fat_offset()
            + u64::from(self.num_fat) * u64::from(self.fat_sz) * u64::from(self.bytes_per_sec)
    }

    pub fn root_dir_size(&self) -> u64 {
        u64::from(self.root_ent_cnt) * 32
    }

    pub fn data_offset(&self) -> u64 {
        let bps = u64::from(self.bytes_per_sec);
        self.root_dir_offset() + self.root_dir_size().div_ceil(bps) * bps
    }

    /// Byte offset of data cluster `cluster` (numbering starts at 2).
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + u64::from(cluster - 2) * self.cluster_size()
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_count.saturating_add(2)
    }

    /// Label stored in the extended boot record, if it is set.
    pub fn label(&self) -> Option<String> {
        self.vol_lab.as_ref().and_then(|lab| {
            let text: String = lab.iter().map(|&b| char::from(b)).collect();
            let text = text.trim_end();
            (!text.is_empty() && text != "NO NAME").then(|| text.to_string())
        })
    }
}
