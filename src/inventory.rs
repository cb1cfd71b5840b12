//! Read-only report of the block devices present on the machine.
use std::fs;
use std::io;

use serde::Serialize;

use crate::prelude::*;

/// The kernel reports `size` and partition offsets in 512 byte units, whatever the device.
const KERNEL_SECTOR: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskPartition {
    pub path: PathBuf,
    /// First logical sector.
    pub start: u64,
    /// Last logical sector, inclusive.
    pub end: u64,
}

impl DiskPartition {
    #[must_use]
    pub const fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disk {
    pub path: PathBuf,
    /// In logical sectors.
    pub sector_count: u64,
    pub sector_size: u64,
    pub removable: bool,
    pub partitions: Vec<DiskPartition>,
}

impl Disk {
    /// Size in (decimal) megabytes.
    #[must_use]
    pub const fn size_mb(&self) -> u64 {
        mb(self.sector_count, self.sector_size)
    }

    #[must_use]
    pub const fn partition_size_mb(&self, part: &DiskPartition) -> u64 {
        mb(part.sectors(), self.sector_size)
    }
}

const fn mb(sectors: u64, sector_size: u64) -> u64 {
    sectors * sector_size / 1_000_000
}

/// Anything that can list the disks of a machine.
pub trait DiskProbe {
    fn probe(&self) -> io::Result<Vec<Disk>>;
}

/// Reads `/sys/block`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    pub sys_block: PathBuf,
    pub dev: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            dev: PathBuf::from("/dev"),
        }
    }
}

fn read_u64(path: &Path) -> io::Result<u64> {
    fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

impl SysfsProbe {
    fn disk(&self, name: &str) -> io::Result<Option<Disk>> {
        let dir = self.sys_block.join(name);
        let size = read_u64(&dir.join("size"))?;
        if size == 0 {
            trace!(name, "Skipping empty device");
            return Ok(None);
        }
        let sector_size = match read_u64(&dir.join("queue/logical_block_size")) {
            Ok(0) | Err(_) => KERNEL_SECTOR,
            Ok(n) => n,
        };
        let ratio = sector_size / KERNEL_SECTOR;
        let removable = fs::read_to_string(dir.join("removable")).is_ok_and(|s| s.trim() == "1");

        let mut partitions = vec![];
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let part_dir = entry.path();
            if !part_dir.join("partition").exists() {
                continue;
            }
            let start = read_u64(&part_dir.join("start"))? / ratio.max(1);
            let len = read_u64(&part_dir.join("size"))? / ratio.max(1);
            if len == 0 {
                continue;
            }
            partitions.push(DiskPartition {
                path: self.dev.join(entry.file_name()),
                start,
                end: start + len - 1,
            });
        }
        partitions.sort_by_key(|p| p.start);

        Ok(Some(Disk {
            path: self.dev.join(name),
            sector_count: size / ratio.max(1),
            sector_size,
            removable,
            partitions,
        }))
    }
}

impl DiskProbe for SysfsProbe {
    #[tracing::instrument(skip(self), fields(sys_block = ?self.sys_block))]
    fn probe(&self) -> io::Result<Vec<Disk>> {
        let mut disks = vec![];
        for entry in fs::read_dir(&self.sys_block)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with("ram") {
                continue;
            }
            match self.disk(&name) {
                Ok(Some(disk)) => disks.push(disk),
                Ok(None) => {}
                Err(e) => warn!(name, "Cannot read device: {e}"),
            }
        }
        disks.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(disks)
    }
}
