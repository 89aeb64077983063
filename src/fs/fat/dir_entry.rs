//! 32-byte directory entries, VFAT long names and FAT timestamps.

use byteorder::{ByteOrder, LittleEndian};
use chrono::NaiveDate;

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_LONG_NAME: u8 = 0x0F;

const DELETED: u8 = 0xE5;
const LAST_LONG_ENTRY: u8 = 0x40;
const LFN_CHARS: usize = 13;
/// Byte offsets of the 13 UTF-16 units in a long-name slot.
const LFN_OFFSETS: [usize; LFN_CHARS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// NT reserved-byte flags marking lowercase 8.3 parts.
const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;

/// A short (8.3) directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortEntry {
    pub name:       [u8; 11],
    pub attr:       u8,
    pub nt_res:     u8,
    pub wrt_time:   u16,
    pub wrt_date:   u16,
    pub first_clus: u32,
    pub file_size:  u32,
}

impl ShortEntry {
    fn parse(raw: &[u8]) -> Self {
        let u16_at = |i: usize| LittleEndian::read_u16(&raw[i..i + 2]);
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[..11]);
        Self {
            name,
            attr:       raw[11],
            nt_res:     raw[12],
            wrt_time:   u16_at(22),
            wrt_date:   u16_at(24),
            first_clus: (u32::from(u16_at(20)) << 16) | u32::from(u16_at(26)),
            file_size:  LittleEndian::read_u32(&raw[28..32]),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0
    }

    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.'
    }

    /// `BASE.EXT`, with the lowercase hints applied.
    pub fn short_name(&self) -> String {
        let mut raw = self.name;
        if raw[0] == 0x05 {
            raw[0] = DELETED;
        }
        let part = |bytes: &[u8], lower: bool| -> String {
            let s: String = bytes.iter().map(|&b| char::from(b)).collect();
            let s = s.trim_end();
            if lower { s.to_ascii_lowercase() } else { s.to_string() }
        };
        let base = part(&raw[..8], self.nt_res & NT_LOWER_BASE != 0);
        let ext = part(&raw[8..], self.nt_res & NT_LOWER_EXT != 0);
        if ext.is_empty() { base } else { format!("{base}.{ext}") }
    }

    /// Raw label text of a volume-label entry.
    pub fn label(&self) -> String {
        let s: String = self.name.iter().map(|&b| char::from(b)).collect();
        s.trim_end().to_string()
    }

    /// Checksum a long-name slot carries for its short entry.
    pub fn checksum(&self) -> u8 {
        self.name
            .iter()
            .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
    }

    /// Last write time as Unix seconds (FAT stores local time; treated as UTC).
    pub fn mtime(&self) -> Option<i64> {
        fat_timestamp(self.wrt_date, self.wrt_time)
    }
}

pub fn fat_timestamp(date: u16, time: u16) -> Option<i64> {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc().timestamp())
}

/// One listed entry with its resolved display name.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name:  String,
    pub short: ShortEntry,
}

/// Accumulates long-name slots until the short entry they belong to.
#[derive(Default)]
struct LongName {
    units:    Vec<u16>,
    checksum: u8,
    /// Ordinal expected in the next slot; 0 when no sequence is open.
    next:     u8,
}

impl LongName {
    fn push(&mut self, raw: &[u8]) {
        let ord = raw[0];
        let seq = ord & 0x3F;
        if ord & LAST_LONG_ENTRY != 0 {
            self.units = vec![0xFFFF; usize::from(seq) * LFN_CHARS];
            self.checksum = raw[13];
            self.next = seq;
        }
        if seq == 0 || seq != self.next || raw[13] != self.checksum {
            self.reset();
            return;
        }
        let base = usize::from(seq - 1) * LFN_CHARS;
        for (i, &off) in LFN_OFFSETS.iter().enumerate() {
            self.units[base + i] = LittleEndian::read_u16(&raw[off..off + 2]);
        }
        self.next = seq - 1;
    }

    /// The assembled name if a complete sequence matches `short`.
    fn take(&mut self, short: &ShortEntry) -> Option<String> {
        let complete = self.next == 0 && !self.units.is_empty() && self.checksum == short.checksum();
        let units = std::mem::take(&mut self.units);
        self.next = 0;
        if !complete {
            return None;
        }
        let end = units.iter().position(|&u| u == 0 || u == 0xFFFF).unwrap_or(units.len());
        Some(String::from_utf16_lossy(&units[..end])).filter(|s| !s.is_empty())
    }

    fn reset(&mut self) {
        self.units.clear();
        self.next = 0;
    }
}

/// Walk the raw bytes of a directory, calling `f` per live entry (volume
/// labels and dot entries included) until it returns `true` or the end
/// marker is reached.
pub fn walk(data: &[u8], mut f: impl FnMut(DirEntry) -> bool) {
    let mut long = LongName::default();
    for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
        match raw[0] {
            0x00 => return,
            DELETED => {
                long.reset();
                continue;
            }
            _ => {}
        }
        if raw[11] & 0x3F == ATTR_LONG_NAME {
            long.push(raw);
            continue;
        }
        let short = ShortEntry::parse(raw);
        let name = long.take(&short).unwrap_or_else(|| short.short_name());
        if f(DirEntry { name, short }) {
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode a short entry.
    pub(crate) fn short(name: &[u8; 11], attr: u8, cluster: u32, size: u32, date: u16, time: u16) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[..11].copy_from_slice(name);
        e[11] = attr;
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[22..24].copy_from_slice(&time.to_le_bytes());
        e[24..26].copy_from_slice(&date.to_le_bytes());
        e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }

    /// Encode the long-name slots for `long`, in on-disk order.
    pub(crate) fn long_slots(long: &str, short_name: &[u8; 11]) -> Vec<[u8; 32]> {
        let checksum = ShortEntry::parse(&short(short_name, 0, 0, 0, 0, 0)).checksum();
        let mut units: Vec<u16> = long.encode_utf16().collect();
        let count = units.len().div_ceil(LFN_CHARS);
        if units.len() < count * LFN_CHARS {
            units.push(0);
        }
        units.resize(count * LFN_CHARS, 0xFFFF);

        (1..=count)
            .rev()
            .map(|seq| {
                let mut e = [0u8; 32];
                e[0] = seq as u8 | if seq == count { LAST_LONG_ENTRY } else { 0 };
                e[11] = ATTR_LONG_NAME;
                e[13] = checksum;
                for (i, &off) in LFN_OFFSETS.iter().enumerate() {
                    e[off..off + 2].copy_from_slice(&units[(seq - 1) * LFN_CHARS + i].to_le_bytes());
                }
                e
            })
            .collect()
    }

    fn names(data: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        walk(data, |e| {
            out.push(e.name);
            false
        });
        out
    }

    #[test]
    fn long_names_replace_short_names() {
        let mut dir = Vec::new();
        for slot in long_slots("A fairly long name.jpeg", b"AFAIRL~1JPE") {
            dir.extend_from_slice(&slot);
        }
        dir.extend_from_slice(&short(b"AFAIRL~1JPE", 0x20, 3, 10, 0, 0));
        dir.extend_from_slice(&short(b"PLAIN   TXT", 0x20, 4, 10, 0, 0));
        assert_eq!(names(&dir), ["A fairly long name.jpeg", "PLAIN.TXT"]);
    }

    #[test]
    fn checksum_mismatch_falls_back_to_short_name() {
        let mut dir = Vec::new();
        for slot in long_slots("Orphaned long name", b"ORPHAN~1   ") {
            dir.extend_from_slice(&slot);
        }
        dir.extend_from_slice(&short(b"OTHER   BIN", 0x20, 3, 1, 0, 0));
        assert_eq!(names(&dir), ["OTHER.BIN"]);
    }

    #[test]
    fn deleted_entries_and_end_marker() {
        let mut dir = Vec::new();
        let mut gone = short(b"GONE    TXT", 0x20, 3, 1, 0, 0);
        gone[0] = DELETED;
        dir.extend_from_slice(&gone);
        dir.extend_from_slice(&short(b"KEPT    TXT", 0x20, 4, 1, 0, 0));
        dir.extend_from_slice(&[0u8; 32]);
        dir.extend_from_slice(&short(b"HIDDEN  TXT", 0x20, 5, 1, 0, 0));
        assert_eq!(names(&dir), ["KEPT.TXT"]);
    }

    #[test]
    fn lowercase_hints() {
        let mut raw = short(b"README  MD ", 0x20, 3, 1, 0, 0);
        raw[12] = NT_LOWER_BASE | NT_LOWER_EXT;
        assert_eq!(ShortEntry::parse(&raw).short_name(), "readme.md");
    }

    #[test]
    fn timestamps_decode() {
        let date = ((2024 - 1980) << 9) | (5 << 5) | 17;
        let time = (12 << 11) | (30 << 5) | 5;
        let expected = NaiveDate::from_ymd_opt(2024, 5, 17)
            .and_then(|d| d.and_hms_opt(12, 30, 10))
            .map(|dt| dt.and_utc().timestamp());
        assert_eq!(fat_timestamp(date, time), expected);
        assert_eq!(fat_timestamp(0, 0), None);
    }
}
