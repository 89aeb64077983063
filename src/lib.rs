pub mod error;
pub mod disk;
pub mod raid;
pub mod file;
pub mod fs;
pub mod filter;
pub mod codec;
pub mod config;
pub mod session;

pub use error::{Result, VfsError};
pub use disk::{Disk, DiskDriver, DiskRegistry, PullClass, SECTOR_SIZE};
pub use file::{File, FileSource, FileType};
pub use fs::{DirInfo, FsDriver};
pub use filter::StreamFilter;
pub use config::{LoopbackConfig, SessionConfig};
pub use raid::{RaidArray, RaidLayout, RaidLevel};
pub use session::{FsInfo, Session};
