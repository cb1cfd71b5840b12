use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::prelude::*;

/// Filesystems this tool knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Fat32,
    Ext4,
}

impl FsKind {
    /// Type name understood by `mount(2)` and written to fstab.
    #[must_use]
    pub const fn fstype(self) -> &'static str {
        match self {
            Self::Fat32 => "vfat",
            Self::Ext4 => "ext4",
        }
    }

    /// Filesystem hint stored in the partition table entry.
    #[must_use]
    pub const fn parted_name(self) -> &'static str {
        match self {
            Self::Fat32 => "fat32",
            Self::Ext4 => "ext4",
        }
    }

    #[must_use]
    pub fn mkfs_argv(self, device: &Path, label: &str) -> Vec<String> {
        let device = device.display().to_string();
        let argv = match self {
            Self::Fat32 => ["mkfs.fat", "-F", "32", "-n", label, device.as_str()],
            Self::Ext4 => ["mkfs.ext4", "-F", "-q", "-L", label, device.as_str()],
        };
        argv.map(String::from).to_vec()
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fat32 => "FAT32",
            Self::Ext4 => "ext4",
        })
    }
}

/// Create a `kind` filesystem on a partition node of an attached loop device.
///
/// # Errors
/// - the mkfs tool fails; its diagnostic is carried in the error
#[tracing::instrument(skip(host))]
pub fn format(host: &dyn Host, device: &Path, kind: FsKind, label: &str) -> Result<()> {
    info!("Creating {kind} filesystem");
    host.make_filesystem(device, kind, label)
        .map_err(|source| Error::Format {
            device: device.to_path_buf(),
            kind,
            source,
        })
}
