//! Mount stack for the image's filesystems and the host pseudo-filesystems bound into it.
use std::fs::create_dir_all;

use crate::backend::format::FsKind;
use crate::consts::{ESP_MOUNTPOINT, PSEUDO_FILESYSTEMS};
use crate::error::{Error, TeardownFailure};
use crate::prelude::*;
use crate::util::fs::rooted;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Position in the mount order, starting at 0.
    pub seq: usize,
    /// Device node, or host path for binds.
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub options: Option<String>,
    pub bind: bool,
}

/// Everything mounted during a run, in mount order.
///
/// Unmounting always happens from the top of the stack.
#[derive(Debug, Default)]
pub struct MountStack {
    mounts: Vec<MountPoint>,
    next_seq: usize,
}

impl MountStack {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.mounts.iter()
    }

    #[must_use]
    pub fn contains(&self, target: &Path) -> bool {
        self.mounts.iter().any(|m| m.target == target)
    }

    /// # Errors
    /// - `target` does not exist
    /// - the kernel rejects the mount (busy, already mounted, bad superblock...)
    #[tracing::instrument(skip(self, host, target), fields(mountpoint = ?target))]
    pub fn mount(
        &mut self,
        host: &dyn Host,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: Option<&str>,
    ) -> Result<MountPoint> {
        let mp = MountPoint {
            seq: self.next_seq,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(ToOwned::to_owned),
            options: options.map(ToOwned::to_owned),
            bind: false,
        };
        self.push(host, mp)
    }

    /// Bind a host directory (`/dev`, `/proc`, ...) onto `target`.
    ///
    /// # Errors
    /// - see [`MountStack::mount`]
    #[tracing::instrument(skip(self, host, target), fields(mountpoint = ?target))]
    pub fn mount_bind(
        &mut self,
        host: &dyn Host,
        host_path: &Path,
        target: &Path,
    ) -> Result<MountPoint> {
        let mp = MountPoint {
            seq: self.next_seq,
            source: host_path.to_path_buf(),
            target: target.to_path_buf(),
            fstype: None,
            options: None,
            bind: true,
        };
        self.push(host, mp)
    }

    fn push(&mut self, host: &dyn Host, mp: MountPoint) -> Result<MountPoint> {
        let fail = |source: HostError| Error::Mount {
            device: mp.source.clone(),
            target: mp.target.clone(),
            source,
        };
        if !mp.target.is_dir() {
            let missing =
                std::io::Error::new(std::io::ErrorKind::NotFound, "mount target does not exist");
            return Err(fail(missing.into()));
        }
        host.mount(&mp).map_err(fail)?;
        debug!(seq = mp.seq, source = ?mp.source, mountpoint = ?mp.target, "Mounted");
        self.next_seq += 1;
        self.mounts.push(mp.clone());
        Ok(mp)
    }

    /// Unmount everything, newest first.
    ///
    /// A failed graceful unmount is retried lazily. Entries that survive both attempts
    /// stay on the stack and are reported; the rest of the stack is still processed.
    #[tracing::instrument(skip_all, fields(mounts = self.mounts.len()))]
    pub fn unmount_all(&mut self, host: &dyn Host) -> Vec<TeardownFailure> {
        let mut failures = vec![];
        let mut stuck = vec![];
        while let Some(mp) = self.mounts.pop() {
            let Err(e) = host.unmount(&mp.target, false) else {
                debug!(mountpoint = ?mp.target, "Unmounted");
                continue;
            };
            warn!(mountpoint = ?mp.target, "Unmount failed, retrying lazily: {e}");
            match host.unmount(&mp.target, true) {
                Ok(()) => info!(mountpoint = ?mp.target, "Lazily unmounted"),
                Err(lazy) => {
                    error!(mountpoint = ?mp.target, "Lazy unmount failed: {lazy}");
                    failures.push(TeardownFailure {
                        action: format!("unmount {}", mp.target.display()),
                        diagnostic: format!("{e}; lazy: {lazy}"),
                    });
                    stuck.push(mp);
                }
            }
        }
        stuck.reverse();
        self.mounts = stuck;
        failures
    }
}

/// Build the tree the chroot steps run in: root, the ESP beneath it, then the host binds.
///
/// # Errors
/// - a mount point cannot be created or mounted
#[tracing::instrument(skip(host, stack))]
pub fn mount_tree(
    host: &dyn Host,
    stack: &mut MountStack,
    root: &Path,
    root_node: &Path,
    esp_node: &Path,
) -> Result<()> {
    let mkdir = |device: &Path, target: &Path| {
        create_dir_all(target).map_err(|e| Error::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            source: e.into(),
        })
    };

    stack.mount(host, root_node, root, Some(FsKind::Ext4.fstype()), None)?;

    let esp = rooted(root, Path::new(ESP_MOUNTPOINT));
    mkdir(esp_node, &esp)?;
    stack.mount(host, esp_node, &esp, Some(FsKind::Fat32.fstype()), None)?;

    for fs in bind_sources() {
        let target = rooted(root, &fs);
        mkdir(&fs, &target)?;
        stack.mount_bind(host, &fs, &target)?;
    }
    Ok(())
}

/// Host directories every chroot session needs.
pub fn bind_sources() -> impl Iterator<Item = PathBuf> {
    PSEUDO_FILESYSTEMS.iter().map(PathBuf::from)
}
