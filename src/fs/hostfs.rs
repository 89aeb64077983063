//! Host filesystem passthrough on the `(host)` device.
//!
//! Paths are handed to `std::fs` unchanged, except that on Windows a leading
//! `/` before a drive letter (`/C:/images/a.img`) is dropped.

use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use super::{DirHook, DirInfo, FsDriver};
use crate::disk::host::{HOST_DEVICE_ID, HOST_DRIVER_NAME};
use crate::disk::Disk;
use crate::error::{Result, VfsError};
use crate::file::{File, FileSource};

pub struct HostFs;

fn check_disk(disk: &Disk) -> Result<()> {
    if disk.driver() != HOST_DRIVER_NAME || disk.id() != HOST_DEVICE_ID {
        return Err(VfsError::BadFs("not a host device".into()));
    }
    Ok(())
}

fn host_path(path: &str) -> PathBuf {
    if cfg!(windows) {
        let bytes = path.as_bytes();
        if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
            return PathBuf::from(&path[1..]);
        }
    }
    if path.is_empty() {
        return PathBuf::from("/");
    }
    PathBuf::from(path)
}

fn map_io(path: &str, err: std::io::Error) -> VfsError {
    match err.kind() {
        ErrorKind::NotFound => VfsError::FileNotFound(path.to_string()),
        _ => VfsError::Io(err),
    }
}

fn info(meta: &fs::Metadata) -> DirInfo {
    DirInfo {
        is_dir: meta.is_dir(),
        size:   (!meta.is_dir()).then(|| meta.len()),
        mtime:  meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_secs()).ok()),
    }
}

impl FsDriver for HostFs {
    fn name(&self) -> &'static str { "hostfs" }

    fn dir(&self, disk: &mut Disk, path: &str, hook: &mut DirHook<'_>) -> Result<()> {
        check_disk(disk)?;
        let dir = host_path(path);
        let meta = fs::metadata(&dir).map_err(|e| map_io(path, e))?;
        if !meta.is_dir() {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        for entry in fs::read_dir(&dir).map_err(|e| map_io(path, e))? {
            let entry = entry?;
            // Entries that vanish or cannot be stat'ed are skipped.
            let Ok(meta) = entry.metadata() else { continue };
            let name = entry.file_name();
            if hook(&name.to_string_lossy(), &info(&meta)) {
                break;
            }
        }
        Ok(())
    }

    fn open(&self, disk: Disk, path: &str) -> Result<File> {
        check_disk(&disk)?;
        let host = host_path(path);
        let file = fs::File::open(&host).map_err(|e| map_io(path, e))?;
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(VfsError::BadFs(format!("`{path}' is a directory")));
        }
        let source = HostFileSource { file, _disk: disk };
        Ok(File::new(Box::new(source), Some(meta.len())))
    }
}

struct HostFileSource {
    file:  fs::File,
    _disk: Disk,
}

impl FileSource for HostFileSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            match self.file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(VfsError::Read(e.to_string())),
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::host::{HostRootDriver, HOST_DEVICE};
    use crate::disk::memdisk::{MemDiskDriver, MemDiskTable};
    use crate::disk::{DiskDriver, DiskRegistry};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn host_disk() -> Disk {
        HostRootDriver.open(HOST_DEVICE, &DiskRegistry::new()).unwrap()
    }

    #[test]
    fn lists_and_reads_host_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"host bytes").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let root = dir.path().to_str().unwrap().to_string();

        let mut seen = Vec::new();
        HostFs
            .dir(&mut host_disk(), &root, &mut |name, info| {
                seen.push((name.to_string(), info.is_dir, info.size));
                false
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec![("a.bin".into(), false, Some(10)), ("sub".into(), true, None)]);

        let mut f = HostFs.open(host_disk(), &format!("{root}/a.bin")).unwrap();
        assert_eq!(f.size(), Some(10));
        let mut buf = [0u8; 10];
        f.seek(5).unwrap();
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"bytes");
    }

    #[test]
    fn missing_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("{}/nope", dir.path().display());
        assert!(matches!(HostFs.open(host_disk(), &path), Err(VfsError::FileNotFound(_))));
    }

    #[test]
    fn rejects_other_devices() {
        let table = Rc::new(RefCell::new(MemDiskTable::default()));
        table.borrow_mut().add("m", vec![0; 512]).unwrap();
        let mut disk = MemDiskDriver::new(table).open("m", &DiskRegistry::new()).unwrap();
        assert!(matches!(HostFs.dir(&mut disk, "/", &mut |_, _| true), Err(VfsError::BadFs(_))));
    }
}
