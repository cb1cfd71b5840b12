//! The `fstab(5)` line format, shared by `/etc/fstab` and `/proc/self/mounts`.
use std::str::FromStr;

use crate::prelude::*;
use crate::util::fs::unescape_mount_path;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FsTableError {
    #[error("invalid fstab entry: {0}")]
    InvalidEntry(String),
    #[error("invalid fsck order: {0}")]
    InvalidFsckOrder(u8),
}

/// When `fsck` checks the filesystem at boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FsckOrder {
    #[default]
    NoCheck = 0,
    /// The root filesystem, checked first.
    Boot = 1,
    PostBoot = 2,
}

impl TryFrom<u8> for FsckOrder {
    type Error = FsTableError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoCheck),
            1 => Ok(Self::Boot),
            2 => Ok(Self::PostBoot),
            _ => Err(FsTableError::InvalidFsckOrder(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// `/dev/sda1`, `UUID=...`, `LABEL=...`, or a pseudo source like `proc`.
    pub device_spec: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub dump: u8,
    pub pass: FsckOrder,
}

impl FsEntry {
    /// # Errors
    /// - fewer than six fields, or a non-numeric dump/pass field
    pub fn from_line_str(line: &str) -> Result<Self, FsTableError> {
        let invalid = || FsTableError::InvalidEntry(line.to_owned());
        let parts = line.split_whitespace().collect_vec();
        let [device_spec, mountpoint, fs_type, options, dump, pass] = parts[..] else {
            return Err(invalid());
        };
        Ok(Self {
            device_spec: device_spec.to_owned(),
            mountpoint: unescape_mount_path(mountpoint),
            fs_type: fs_type.to_owned(),
            options: options.split(',').map(ToOwned::to_owned).collect(),
            dump: dump.parse().map_err(|_| invalid())?,
            pass: FsckOrder::try_from(pass.parse::<u8>().map_err(|_| invalid())?)?,
        })
    }
}

impl std::fmt::Display for FsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let options = if self.options.is_empty() {
            "defaults".to_owned()
        } else {
            self.options.join(",")
        };
        write!(
            f,
            "{} {} {} {options} {} {}",
            self.device_spec, self.mountpoint, self.fs_type, self.dump, self.pass as u8
        )
    }
}

/// A parsed mount table. Comments and blank lines are dropped.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    pub entries: Vec<FsEntry>,
}

impl FromStr for MountTable {
    type Err = FsTableError;

    fn from_str(table: &str) -> Result<Self, Self::Err> {
        let entries = table
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(FsEntry::from_line_str)
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }
}

impl MountTable {
    /// # Errors
    /// - the file cannot be read or holds a malformed line
    pub fn read(path: &Path) -> std::io::Result<Self> {
        std::fs::read_to_string(path)?
            .parse()
            .map_err(std::io::Error::other)
    }

    /// Mount points at or below `dir`, in table order.
    #[must_use]
    pub fn mounted_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(|e| PathBuf::from(&e.mountpoint))
            .filter(|mp| mp.starts_with(dir))
            .collect()
    }

    /// The entry currently visible at `mountpoint`: the last one, since later mounts shadow
    /// earlier ones.
    #[must_use]
    pub fn find(&self, mountpoint: &Path) -> Option<&FsEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| Path::new(&e.mountpoint) == mountpoint)
    }
}
