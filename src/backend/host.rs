//! Every privileged side effect of the pipeline goes through [`Host`].
//!
//! [`LinuxHost`] is the real thing and can only be built from a [`Privileged`] token.
//! Tests swap in a recording fake so ordering and teardown can be checked without root.
use std::process::Command;
use std::time::{Duration, Instant};

use sys_mount::MountFlags;

use crate::backend::{
    chroot::CommandSpec, format::FsKind, fstab::MountTable, image::Image, mounts::MountPoint,
    privilege::Privileged,
};
use crate::consts::HOST_MOUNTS;
use crate::prelude::*;
use crate::util::cmd::{run_logged, Captured};

/// How long to wait for udev to create partition nodes after attaching a loop device.
const NODE_TIMEOUT: Duration = Duration::from_secs(10);
const NODE_POLL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("cannot execute `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` failed ({status}):\n{diagnostic}")]
    Failed {
        program: String,
        status: String,
        diagnostic: String,
    },
    #[error("timed out waiting for {0:?} to appear")]
    Timeout(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Capability interface over the block device, mount and chroot machinery of the host.
pub trait Host {
    /// Write a GUID partition table describing `image.partitions` into the backing file.
    fn partition_image(&self, image: &Image) -> Result<(), HostError>;
    /// Attach `backing` to a free loop device with partition scanning, returning its path.
    fn attach_loop(&self, backing: &Path) -> Result<PathBuf, HostError>;
    fn detach_loop(&self, device: &Path) -> Result<(), HostError>;
    /// Path of partition `number` of `device`, once it exists.
    fn partition_node(&self, device: &Path, number: usize) -> Result<PathBuf, HostError>;
    fn make_filesystem(&self, device: &Path, kind: FsKind, label: &str) -> Result<(), HostError>;
    fn mount(&self, mount: &MountPoint) -> Result<(), HostError>;
    /// Unmount `target`; `lazy` detaches it from the namespace even while busy.
    fn unmount(&self, target: &Path, lazy: bool) -> Result<(), HostError>;
    /// Mount points at or below `dir`, as the kernel currently sees them.
    fn mounts_under(&self, dir: &Path) -> Result<Vec<PathBuf>, HostError>;
    /// Run a command with `root` as its filesystem root, returning its stdout.
    fn chroot_exec(&self, root: &Path, command: &CommandSpec) -> Result<String, HostError>;
}

/// Run a command on the host, failing on a non-zero exit.
///
/// # Errors
/// - the program cannot be spawned
/// - it exits unsuccessfully; the error carries the tail of its output
pub fn run(cmd: &mut Command) -> Result<Captured, HostError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let out = run_logged(&program, cmd).map_err(|source| HostError::Spawn {
        program: program.clone(),
        source,
    })?;
    if !out.status.success() {
        return Err(HostError::Failed {
            program,
            status: out.status.to_string(),
            diagnostic: out.diagnostic(),
        });
    }
    Ok(out)
}

/// Loop and NVMe style devices name partitions `<dev>p<N>`, everything else `<dev><N>`.
#[must_use]
pub fn partition_path(device: &Path, number: usize) -> PathBuf {
    let dev = device.to_string_lossy();
    if dev.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{dev}p{number}"))
    } else {
        PathBuf::from(format!("{dev}{number}"))
    }
}

#[derive(Debug)]
pub struct LinuxHost {
    _privilege: Privileged,
    mounts_table: PathBuf,
}

impl LinuxHost {
    #[must_use]
    pub fn new(privilege: Privileged) -> Self {
        Self {
            _privilege: privilege,
            mounts_table: PathBuf::from(HOST_MOUNTS),
        }
    }
}

impl Host for LinuxHost {
    #[tracing::instrument(skip(self, image), fields(path = ?image.path))]
    fn partition_image(&self, image: &Image) -> Result<(), HostError> {
        run(Command::new("parted")
            .args(["--script", "--align", "optimal"])
            .arg(&image.path)
            .args(image.parted_args()))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn attach_loop(&self, backing: &Path) -> Result<PathBuf, HostError> {
        let out = run(Command::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg(backing))?;
        let device = PathBuf::from(out.stdout.trim());
        info!(?device, "Attached loop device");
        Ok(device)
    }

    #[tracing::instrument(skip(self))]
    fn detach_loop(&self, device: &Path) -> Result<(), HostError> {
        run(Command::new("losetup").arg("--detach").arg(device))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn partition_node(&self, device: &Path, number: usize) -> Result<PathBuf, HostError> {
        let node = partition_path(device, number);
        if let Err(e) = run(Command::new("udevadm").arg("settle")) {
            warn!("udevadm settle failed, polling for {node:?} anyway: {e}");
        }
        let start = Instant::now();
        while !node.exists() {
            if start.elapsed() > NODE_TIMEOUT {
                return Err(HostError::Timeout(node));
            }
            std::thread::sleep(NODE_POLL);
        }
        Ok(node)
    }

    #[tracing::instrument(skip(self))]
    fn make_filesystem(&self, device: &Path, kind: FsKind, label: &str) -> Result<(), HostError> {
        let argv = kind.mkfs_argv(device, label);
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::other("empty mkfs command").into());
        };
        run(Command::new(program).args(args))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn mount(&self, mount: &MountPoint) -> Result<(), HostError> {
        let mut builder = sys_mount::Mount::builder();
        if mount.bind {
            builder = builder.flags(MountFlags::BIND);
        }
        if let Some(fstype) = &mount.fstype {
            builder = builder.fstype(fstype.as_str());
        }
        if let Some(options) = &mount.options {
            builder = builder.data(options);
        }
        builder.mount(&mount.source, &mount.target)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, target), fields(mountpoint = ?target))]
    fn unmount(&self, target: &Path, lazy: bool) -> Result<(), HostError> {
        if lazy {
            nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH)
        } else {
            nix::mount::umount(target)
        }
        .map_err(|errno| HostError::Io(errno.into()))
    }

    fn mounts_under(&self, dir: &Path) -> Result<Vec<PathBuf>, HostError> {
        let table = MountTable::read(&self.mounts_table)?;
        Ok(table.mounted_under(dir))
    }

    #[tracing::instrument(skip(self, command), fields(step = %command.step))]
    fn chroot_exec(&self, root: &Path, command: &CommandSpec) -> Result<String, HostError> {
        let out = run(Command::new("chroot")
            .arg(root)
            .args(&command.argv)
            .envs(command.env.iter().map(|(k, v)| (k, v))))?;
        Ok(out.stdout)
    }
}
