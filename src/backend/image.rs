//! The backing image file and the partition layout written into it.
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::FileTypeExt;

use bytesize::ByteSize;

use crate::backend::format::FsKind;
use crate::consts::{ESP_LABEL, ROOT_LABEL};
use crate::error::Error;
use crate::prelude::*;

const MIB: u64 = 1024 * 1024;

/// Start or end of a partition, as an absolute size or a share of the whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Bytes(ByteSize),
    /// 0 to 100 percent of the image size.
    Percent(u8),
}

impl Offset {
    #[must_use]
    pub fn resolve(self, total: u64) -> u64 {
        match self {
            Self::Bytes(b) => b.as_u64(),
            Self::Percent(p) => {
                let share = u128::from(total) * u128::from(p.min(100)) / 100;
                u64::try_from(share).unwrap_or(total)
            }
        }
    }

    /// Render as a `parted` unit expression.
    #[must_use]
    pub fn parted_arg(self) -> String {
        match self {
            Self::Bytes(b) if b.as_u64() % MIB == 0 => format!("{}MiB", b.as_u64() / MIB),
            Self::Bytes(b) => format!("{}B", b.as_u64()),
            Self::Percent(p) => format!("{p}%"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRole {
    Esp,
    Root,
}

impl PartitionRole {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Esp => ESP_LABEL,
            Self::Root => ROOT_LABEL,
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Esp => "ESP",
            Self::Root => "ROOT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub role: PartitionRole,
    pub fs: FsKind,
    pub start: Offset,
    pub end: Offset,
    /// Partition node once the image is attached to a loop device.
    pub node: Option<PathBuf>,
}

impl Partition {
    /// Byte range `[start, end)` inside an image of `total` bytes.
    #[must_use]
    pub fn range(&self, total: u64) -> (u64, u64) {
        (self.start.resolve(total), self.end.resolve(total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub path: PathBuf,
    pub size: ByteSize,
    pub table: TableKind,
    /// Ordered by start offset, ESP first.
    pub partitions: Vec<Partition>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{0} partition is empty or reversed")]
    Empty(PartitionRole),
    #[error("{0} partition ends past the end of the image")]
    OutOfBounds(PartitionRole),
    #[error("{0} partition overlaps the {1} partition")]
    Overlap(PartitionRole, PartitionRole),
    #[error("partitions must be ordered by start offset with the ESP first")]
    Order,
}

impl Image {
    /// Two partition GPT layout: ESP from the start of the image to `esp_end`, root from
    /// there to the end.
    #[must_use]
    pub fn efi_layout(path: PathBuf, size: ByteSize, esp_end: ByteSize) -> Self {
        Self {
            path,
            size,
            table: TableKind::Gpt,
            partitions: vec![
                Partition {
                    role: PartitionRole::Esp,
                    fs: FsKind::Fat32,
                    start: Offset::Percent(0),
                    end: Offset::Bytes(esp_end),
                    node: None,
                },
                Partition {
                    role: PartitionRole::Root,
                    fs: FsKind::Ext4,
                    start: Offset::Bytes(esp_end),
                    end: Offset::Percent(100),
                    node: None,
                },
            ],
        }
    }

    #[must_use]
    pub fn partition(&self, role: PartitionRole) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.role == role)
    }

    /// If `[start, end)` overlaps an existing partition, return that partition's role.
    #[must_use]
    pub fn overlaps_region(&self, start: u64, end: u64) -> Option<PartitionRole> {
        let total = self.size.as_u64();
        self.partitions
            .iter()
            .find(|part| {
                let (pstart, pend) = part.range(total);
                start < pend && pstart < end
            })
            .map(|part| part.role)
    }

    /// Check that partitions are non-empty, in bounds, ordered, and don't overlap.
    ///
    /// # Errors
    /// - the first violated invariant
    pub fn validate(&self) -> Result<(), LayoutError> {
        let total = self.size.as_u64();
        if self.partitions.first().map(|p| p.role) != Some(PartitionRole::Esp) {
            return Err(LayoutError::Order);
        }
        for (i, part) in self.partitions.iter().enumerate() {
            let (start, end) = part.range(total);
            if start >= end {
                return Err(LayoutError::Empty(part.role));
            }
            if end > total {
                return Err(LayoutError::OutOfBounds(part.role));
            }
            let earlier = Self {
                partitions: self.partitions[..i].to_vec(),
                ..self.clone()
            };
            if let Some(other) = earlier.overlaps_region(start, end) {
                return Err(LayoutError::Overlap(part.role, other));
            }
            if i > 0 && self.partitions[i - 1].range(total).0 > start {
                return Err(LayoutError::Order);
            }
        }
        Ok(())
    }

    /// Arguments for `parted --script <image>` that lay out the partition table.
    #[must_use]
    pub fn parted_args(&self) -> Vec<String> {
        let mut args = vec!["mklabel".to_owned(), "gpt".to_owned()];
        for (i, part) in self.partitions.iter().enumerate() {
            args.extend([
                "mkpart".to_owned(),
                part.role.label().to_owned(),
                part.fs.parted_name().to_owned(),
                part.start.parted_arg(),
                part.end.parted_arg(),
            ]);
            if part.role == PartitionRole::Esp {
                args.extend([
                    "set".to_owned(),
                    (i + 1).to_string(),
                    "esp".to_owned(),
                    "on".to_owned(),
                ]);
            }
        }
        args
    }

    /// Create the zero-filled backing file and write the partition table into it.
    ///
    /// Destroys whatever regular file was at `self.path` before.
    ///
    /// # Errors
    /// - the layout is invalid
    /// - the path is not a regular file, or is unwritable
    /// - the filesystem it lives on can't hold the image
    /// - writing the partition table fails
    #[tracing::instrument(skip(self, host), fields(path = ?self.path, size = %self.size))]
    pub fn allocate(&self, host: &dyn Host, sparse: bool) -> Result<()> {
        let fail = |source: Box<dyn std::error::Error + Send + Sync>| Error::Allocation {
            path: self.path.clone(),
            source,
        };
        self.validate().map_err(|e| fail(e.into()))?;
        self.create_backing_file(sparse).map_err(|e| fail(e.into()))?;
        host.partition_image(self).map_err(|e| fail(e.into()))?;
        info!("Wrote GPT with {} partitions", self.partitions.len());
        Ok(())
    }

    fn create_backing_file(&self, sparse: bool) -> std::io::Result<()> {
        let size = self.size.as_u64();
        let reclaimed = match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_file() => {
                warn!("Overwriting existing image at {:?}", self.path);
                meta.len()
            }
            Ok(meta) if meta.file_type().is_block_device() => {
                return Err(std::io::Error::other("refusing to overwrite a block device"));
            }
            Ok(_) => return Err(std::io::Error::other("refusing to overwrite a non-regular file")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let stat = nix::sys::statvfs::statvfs(parent)?;
        #[allow(clippy::useless_conversion)]
        let available = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
        if available + reclaimed < size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!(
                    "{} free on {parent:?}, image needs {}",
                    ByteSize::b(available + reclaimed),
                    self.size
                ),
            ));
        }

        let file = File::create(&self.path)?;
        if sparse {
            file.set_len(size)?;
        } else {
            let mut writer = BufWriter::with_capacity(4 * MIB as usize, file);
            std::io::copy(&mut std::io::repeat(0).take(size), &mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        debug!(sparse, "Created backing file");
        Ok(())
    }
}
