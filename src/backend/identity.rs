//! Which device backs a path inside the chroot, its filesystem UUID, and the fstab built
//! from them.
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::process::Command;

use crate::backend::chroot::{ChrootSession, ChrootStep, SessionStep, StepContext};
use crate::backend::fstab::{FsEntry, FsckOrder, MountTable};
use crate::consts::{ESP_FSTAB_OPTIONS, ESP_MOUNTPOINT, FSTAB, HOST_MOUNTS, ROOT_FSTAB_OPTIONS};
use crate::error::BoxError;
use crate::prelude::*;
use crate::util::fs::rooted;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemIdentity {
    /// Device node during this run, e.g. `/dev/loop7p2`. Only good for comments.
    pub device: PathBuf,
    pub uuid: String,
    /// Path inside the chroot.
    pub mountpoint: PathBuf,
    pub fstype: String,
}

impl FilesystemIdentity {
    #[must_use]
    pub fn fstab_entry(&self) -> FsEntry {
        let (options, pass) = if self.mountpoint == Path::new("/") {
            (ROOT_FSTAB_OPTIONS, FsckOrder::Boot)
        } else if self.mountpoint == Path::new(ESP_MOUNTPOINT) {
            (ESP_FSTAB_OPTIONS, FsckOrder::Boot)
        } else {
            ("defaults", FsckOrder::PostBoot)
        };
        FsEntry {
            device_spec: format!("UUID={}", self.uuid),
            mountpoint: self.mountpoint.to_string_lossy().into_owned(),
            fs_type: self.fstype.clone(),
            options: vec![options.to_owned()],
            dump: 0,
            pass,
        }
    }
}

/// The mount that a path is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device: PathBuf,
    pub fstype: String,
}

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
    #[error("nothing is mounted at {0:?} inside the chroot")]
    NotMounted(PathBuf),
    #[error("{device:?} (backing {path:?}) has no filesystem UUID")]
    NoUuid { device: PathBuf, path: PathBuf },
    #[error("cannot look up {what}")]
    Probe {
        what: String,
        #[source]
        source: BoxError,
    },
    #[error("cannot write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Typed lookups behind identity resolution.
pub trait IdentityProbe {
    /// The mount `path` (as seen inside the session) is the mount point of, if any.
    fn backing_mount(
        &self,
        session: &ChrootSession,
        path: &Path,
    ) -> Result<Option<MountRecord>, IdentityError>;
    fn uuid(&self, device: &Path) -> Result<Option<String>, IdentityError>;
}

/// # Errors
/// - nothing is mounted at `path`
/// - the backing device has no UUID, or probing it fails
#[tracing::instrument(skip(probe, session), fields(root = ?session.root))]
pub fn resolve(
    probe: &dyn IdentityProbe,
    session: &ChrootSession,
    path: &Path,
) -> Result<FilesystemIdentity, IdentityError> {
    let record = probe
        .backing_mount(session, path)?
        .ok_or_else(|| IdentityError::NotMounted(path.to_path_buf()))?;
    let uuid = probe
        .uuid(&record.device)?
        .ok_or_else(|| IdentityError::NoUuid {
            device: record.device.clone(),
            path: path.to_path_buf(),
        })?;
    debug!(device = ?record.device, %uuid, "Resolved identity");
    Ok(FilesystemIdentity {
        device: record.device,
        uuid,
        mountpoint: path.to_path_buf(),
        fstype: record.fstype,
    })
}

/// # Errors
/// - see [`resolve`]
pub fn resolve_root(
    probe: &dyn IdentityProbe,
    session: &ChrootSession,
) -> Result<FilesystemIdentity, IdentityError> {
    resolve(probe, session, Path::new("/"))
}

/// # Errors
/// - see [`resolve`]
pub fn resolve_esp(
    probe: &dyn IdentityProbe,
    session: &ChrootSession,
) -> Result<FilesystemIdentity, IdentityError> {
    resolve(probe, session, Path::new(ESP_MOUNTPOINT))
}

/// Append one commented entry per identity to the image's `/etc/fstab`.
///
/// Existing content is kept as is, so running this twice duplicates the entries.
///
/// # Errors
/// - the file cannot be opened or written
#[tracing::instrument(skip_all, fields(root = ?session.root))]
pub fn write_fstab(
    session: &ChrootSession,
    identities: &[FilesystemIdentity],
) -> Result<(), IdentityError> {
    let path = rooted(&session.root, Path::new(FSTAB));
    let write_err = |source| IdentityError::Write {
        path: path.clone(),
        source,
    };
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(write_err)?;
    }
    let out: String = identities
        .iter()
        .map(|id| {
            format!(
                "# {} was on {} during installation\n{}\n",
                id.mountpoint.display(),
                id.device.display(),
                id.fstab_entry()
            )
        })
        .collect();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(out.as_bytes()))
        .map_err(write_err)?;
    info!(entries = identities.len(), "Appended to fstab");
    Ok(())
}

/// Resolve root then ESP and record them in fstab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFstab;

impl SessionStep for WriteFstab {
    fn kind(&self) -> ChrootStep {
        ChrootStep::WriteFstab
    }

    fn run(&self, session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()> {
        let identities = vec![resolve_root(ctx.probe, session)?, resolve_esp(ctx.probe, session)?];
        write_fstab(session, &identities)?;
        ctx.identities = identities;
        Ok(())
    }
}

/// Answers lookups from the kernel mount table and the device's filesystem metadata.
#[derive(Debug, Clone)]
pub struct MountTableProbe {
    pub table: PathBuf,
}

impl Default for MountTableProbe {
    fn default() -> Self {
        Self {
            table: PathBuf::from(HOST_MOUNTS),
        }
    }
}

impl IdentityProbe for MountTableProbe {
    fn backing_mount(
        &self,
        session: &ChrootSession,
        path: &Path,
    ) -> Result<Option<MountRecord>, IdentityError> {
        let table = MountTable::read(&self.table).map_err(|e| IdentityError::Probe {
            what: format!("mounts in {}", self.table.display()),
            source: e.into(),
        })?;
        let host_path = rooted(&session.root, path);
        Ok(table.find(&host_path).map(|entry| MountRecord {
            device: PathBuf::from(&entry.device_spec),
            fstype: entry.fs_type.clone(),
        }))
    }

    fn uuid(&self, device: &Path) -> Result<Option<String>, IdentityError> {
        match lsblk::BlockDevice::from_path(device) {
            Ok(dev) if dev.uuid.is_some() => return Ok(dev.uuid),
            Ok(_) => trace!(?device, "lsblk knows no UUID, asking blkid"),
            Err(e) => trace!(?device, "lsblk failed ({e}), asking blkid"),
        }
        let out = crate::backend::host::run(
            Command::new("blkid").args(["-s", "UUID", "-o", "value"]).arg(device),
        )
        .map_err(|e| IdentityError::Probe {
            what: format!("UUID of {}", device.display()),
            source: e.into(),
        })?;
        let uuid = out.stdout.trim();
        Ok((!uuid.is_empty()).then(|| uuid.to_owned()))
    }
}
