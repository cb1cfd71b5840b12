//! Extract the squashfs root filesystem archive onto the mounted root partition.
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::{lchown, symlink, PermissionsExt};
use std::time::{Duration, SystemTime};

use backhand::{FilesystemReader, InnerNode, NodeHeader};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::error::Error;
use crate::prelude::*;

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("cannot open archive")]
    Open(#[source] std::io::Error),
    #[error("corrupt or unsupported squashfs archive")]
    Archive(#[from] backhand::BackhandError),
    #[error("cannot extract {path:?}")]
    Entry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
    /// Device nodes and fifos.
    pub special: usize,
    /// Entries under a protected path.
    pub skipped: usize,
    pub bytes: u64,
}

/// Copy the contents of the squashfs image at `archive` into `root`, overwriting existing
/// files. Nothing at or below a path in `protected` is touched, and nothing on the way to
/// one of `mountpoints` is replaced by a non-directory.
///
/// `callback` receives `(done, total)` after each entry.
///
/// # Errors
/// - the archive cannot be read or is corrupt
/// - an entry cannot be written (permissions, no space left...)
#[tracing::instrument(skip(protected, mountpoints, callback))]
pub fn populate<F: FnMut(usize, usize)>(
    archive: &Path,
    root: &Path,
    protected: &[PathBuf],
    mountpoints: &[PathBuf],
    callback: F,
) -> Result<Stats> {
    let stats =
        unsquash(archive, root, protected, mountpoints, callback).map_err(|e| Error::Populate {
            archive: archive.to_path_buf(),
            source: e.into(),
        })?;
    info!(?stats, "Populated root filesystem");
    Ok(stats)
}

fn unsquash<F: FnMut(usize, usize)>(
    archive: &Path,
    root: &Path,
    protected: &[PathBuf],
    mountpoints: &[PathBuf],
    mut callback: F,
) -> Result<Stats, ExtractError> {
    info!("Expanding squashfs");
    let reader = BufReader::new(File::open(archive).map_err(ExtractError::Open)?);
    let fs = FilesystemReader::from_reader(reader)?;
    let total = fs.files().count();
    let owners = nix::unistd::geteuid().is_root();
    let mut stats = Stats::default();
    let mut dirs = vec![];

    for (i, node) in fs.files().enumerate() {
        callback(i, total);
        let Ok(rel) = node.fullpath.strip_prefix("/") else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let path = root.join(rel);
        if protected.iter().any(|p| path.starts_with(p)) {
            trace!(?path, "Skipping protected path");
            stats.skipped += 1;
            continue;
        }
        let is_dir = matches!(node.inner, InnerNode::Dir(_));
        if !is_dir && mountpoints.iter().any(|m| m.starts_with(&path)) {
            warn!(?path, "Not replacing a mount point or one of its parents");
            stats.skipped += 1;
            continue;
        }
        let entry = |source| ExtractError::Entry {
            path: path.clone(),
            source,
        };
        match &node.inner {
            InnerNode::Dir(_) => {
                make_dir(&path).map_err(entry)?;
                dirs.push((path.clone(), node.header));
                stats.dirs += 1;
                continue;
            }
            InnerNode::File(f) => {
                replace(&path).map_err(entry)?;
                let mut out = File::create(&path).map_err(entry)?;
                stats.bytes += std::io::copy(&mut fs.file(f).reader(), &mut out).map_err(entry)?;
                stats.files += 1;
            }
            InnerNode::Symlink(link) => {
                trace!(link = ?link.link, "Creating symlink");
                replace(&path).map_err(entry)?;
                symlink(&link.link, &path).map_err(entry)?;
                if owners {
                    lchown(&path, Some(node.header.uid), Some(node.header.gid)).map_err(entry)?;
                }
                stats.symlinks += 1;
                continue;
            }
            InnerNode::CharacterDevice(dev) => {
                make_node(&path, SFlag::S_IFCHR, node.header.permissions, dev.device_number)
                    .map_err(entry)?;
                stats.special += 1;
            }
            InnerNode::BlockDevice(dev) => {
                make_node(&path, SFlag::S_IFBLK, node.header.permissions, dev.device_number)
                    .map_err(entry)?;
                stats.special += 1;
            }
            InnerNode::NamedPipe => {
                replace(&path).map_err(entry)?;
                nix::unistd::mkfifo(&path, Mode::from_bits_truncate(node.header.permissions.into()))
                    .map_err(|e| entry(e.into()))?;
                stats.special += 1;
            }
            InnerNode::Socket => {
                trace!(?path, "Ignored socket");
                continue;
            }
        }
        apply_metadata(&path, &node.header, owners).map_err(entry)?;
    }

    // children first, so writing into a directory doesn't bump its mtime afterwards
    dirs.sort_by_key(|(p, _)| std::cmp::Reverse(p.components().count()));
    for (path, header) in dirs {
        apply_metadata(&path, &header, owners)
            .map_err(|source| ExtractError::Entry { path, source })?;
    }
    callback(total, total);
    Ok(stats)
}

/// Make room for a new non-directory entry at `path`.
///
/// Removing instead of opening existing files keeps symlinks in the target from redirecting
/// writes outside the root.
fn replace(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn make_dir(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(path)?;
            fs::create_dir_all(path)
        }
        Err(_) => fs::create_dir_all(path),
    }
}

fn make_node(path: &Path, kind: SFlag, perm: u16, device_number: u32) -> std::io::Result<()> {
    replace(path)?;
    let (major, minor) = decode_device(device_number);
    mknod(
        path,
        kind,
        Mode::from_bits_truncate(perm.into()),
        makedev(major.into(), minor.into()),
    )?;
    Ok(())
}

/// Split a squashfs device number into `(major, minor)`.
const fn decode_device(dev: u32) -> (u32, u32) {
    ((dev >> 8) & 0xfff, (dev & 0xff) | ((dev >> 12) & 0xf_ff00))
}

fn apply_metadata(path: &Path, header: &NodeHeader, owners: bool) -> std::io::Result<()> {
    if owners {
        lchown(path, Some(header.uid), Some(header.gid))?;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(header.permissions.into()))?;
    let kind = fs::symlink_metadata(path)?.file_type();
    if !kind.is_file() && !kind.is_dir() {
        // opening a fifo would block
        return Ok(());
    }
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(header.mtime.into());
    if let Err(e) = File::open(path).and_then(|f| f.set_modified(mtime)) {
        trace!(?path, "Cannot set mtime: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::build_squashfs;

    #[test]
    fn extracts_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_squashfs(dir.path());
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/hostname"), "stale").unwrap();

        let mut seen = 0;
        let stats = populate(&archive, &root, &[], &[], |done, total| {
            assert!(done <= total);
            seen = total;
        })
        .unwrap();

        assert_eq!(fs::read_to_string(root.join("etc/hostname")).unwrap(), "efimg\n");
        assert_eq!(
            fs::read_link(root.join("etc/localtime")).unwrap(),
            Path::new("/usr/share/zoneinfo/UTC")
        );
        assert!(root.join("usr/bin").is_dir());
        assert_eq!(stats.files, 3);
        assert_eq!(stats.symlinks, 1);
        assert!(seen > 0);
        let mode = fs::metadata(root.join("usr/bin/hello")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn skips_protected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_squashfs(dir.path());
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("dev")).unwrap();
        let stats = populate(&archive, &root, &[root.join("dev")], &[], |_, _| ()).unwrap();
        assert!(stats.skipped >= 2);
        assert!(!root.join("dev/placeholder").exists());
        assert!(root.join("etc/hostname").exists());
    }

    #[test]
    fn corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.squashfs");
        fs::write(&archive, b"definitely not squashfs").unwrap();
        let err = populate(&archive, dir.path(), &[], &[], |_, _| ()).unwrap_err();
        assert!(matches!(err, Error::Populate { .. }));
    }

    #[test]
    fn keeps_mount_point_parents() {
        let dir = tempfile::tempdir().unwrap();
        let header = NodeHeader::new(0o644, 0, 0, 1_700_000_000);
        let mut writer = backhand::FilesystemWriter::default();
        writer.push_file(std::io::Cursor::new(b"not a dir\n".to_vec()), "boot", header).unwrap();
        let archive = dir.path().join("boot.squashfs");
        writer.write(&mut File::create(&archive).unwrap()).unwrap();

        let root = dir.path().join("root");
        let esp = root.join("boot/efi");
        fs::create_dir_all(esp.join("EFI")).unwrap();
        fs::write(esp.join("EFI/keep"), "firmware").unwrap();

        let mountpoints = [root.clone(), esp.clone()];
        let stats = populate(&archive, &root, &[], &mountpoints, |_, _| ()).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.files, 0);
        assert_eq!(fs::read_to_string(esp.join("EFI/keep")).unwrap(), "firmware");
    }

    #[test]
    fn device_numbers() {
        // /dev/null is 1:3, /dev/loop300 is 7:300
        assert_eq!(decode_device(0x103), (1, 3));
        assert_eq!(decode_device((7 << 8) | (300 & 0xff) | ((300 & !0xff) << 12)), (7, 300));
    }
}
