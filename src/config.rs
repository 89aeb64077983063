//! Session configuration.
//!
//! ```json
//! {
//!   "root": "ld0",
//!   "host_disks": ["/dev/sdb"],
//!   "loopbacks": [{ "name": "ld0", "path": "/images/disk.img.zst" }],
//!   "raid": [{
//!     "name": "md0", "level": "raid6", "layout": "left-symmetric",
//!     "members": ["m0", "m1", null, "m3"]
//!   }]
//! }
//! ```
//!
//! Every field is optional.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};
use crate::raid::RaidArray;

fn default_decompress() -> bool {
    true
}

/// A loopback mounted while the session is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    pub name:       String,
    /// `(device)/path`, or a host path.
    pub path:       String,
    /// Run the image through the stream filters.
    #[serde(default = "default_decompress")]
    pub decompress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device used by names without a `(device)` part.
    pub root:                Option<String>,
    /// Backing paths for `hd0`, `hd1`, ...
    pub host_disks:          Vec<PathBuf>,
    /// Append the platform's physical drives after `host_disks`.
    pub discover_host_disks: bool,
    pub loopbacks:           Vec<LoopbackConfig>,
    pub raid:                Vec<RaidArray>,
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| VfsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text).map_err(|e| match e {
            VfsError::Config(msg) => VfsError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| VfsError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VfsError::Config(e.to_string()))
    }
}
