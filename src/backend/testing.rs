//! A recording stand-in for the host, so the pipeline can run without root.
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::File;

use backhand::{FilesystemWriter, NodeHeader};

use crate::backend::chroot::{ChrootSession, CommandSpec};
use crate::backend::format::FsKind;
use crate::backend::host::partition_path;
use crate::backend::identity::{IdentityError, IdentityProbe, MountRecord};
use crate::backend::image::Image;
use crate::backend::mounts::MountPoint;
use crate::prelude::*;
use crate::util::fs::rooted;

/// Successful host calls, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PartitionImage(PathBuf),
    Attach(PathBuf),
    Detach(PathBuf),
    Mkfs(PathBuf, FsKind),
    Mount(PathBuf),
    Unmount { target: PathBuf, lazy: bool },
    Chroot(CommandSpec),
}

#[derive(Debug, Clone)]
struct Mounted {
    target: PathBuf,
    source: PathBuf,
    fstype: String,
}

/// Pretends to be the host. Mounting only records the mount (the target directory has to
/// exist), and commands in the chroot only run if they are `grub-mkconfig`, which writes
/// its output file.
///
/// Failures are injected by key: `partition`, `attach`, `detach`, `mkfs:<fstype>`,
/// `mount:<last path component>`, `umount:<...>`, `umount-lazy:<...>`, `chroot:<program>`.
/// `uuid:<device name>` makes the device report no UUID.
#[derive(Debug, Default)]
pub struct FakeHost {
    calls: RefCell<Vec<Call>>,
    mounted: RefCell<Vec<Mounted>>,
    fail: RefCell<HashSet<String>>,
}

impl FakeHost {
    pub fn fail_on(&self, key: &str) {
        self.fail.borrow_mut().insert(key.to_owned());
    }

    pub fn clear_failures(&self) {
        self.fail.borrow_mut().clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    /// Targets that are currently mounted.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.borrow().iter().map(|m| m.target.clone()).collect()
    }

    fn check(&self, key: &str) -> Result<(), HostError> {
        if self.fail.borrow().contains(key) {
            return Err(HostError::Failed {
                program: key.to_owned(),
                status: "exit status: 1".to_owned(),
                diagnostic: format!("injected failure: {key}"),
            });
        }
        Ok(())
    }

    fn fails_at(&self, prefix: &str, path: &Path) -> bool {
        self.fail.borrow().iter().any(|k| {
            k.strip_prefix(prefix)
                .and_then(|k| k.strip_prefix(':'))
                .is_some_and(|suffix| path.ends_with(suffix))
        })
    }

    fn check_path(&self, prefix: &str, path: &Path) -> Result<(), HostError> {
        if self.fails_at(prefix, path) {
            return Err(HostError::Failed {
                program: prefix.to_owned(),
                status: "exit status: 32".to_owned(),
                diagnostic: format!("injected failure: {prefix} {}", path.display()),
            });
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl Host for FakeHost {
    fn partition_image(&self, image: &Image) -> Result<(), HostError> {
        self.check("partition")?;
        self.record(Call::PartitionImage(image.path.clone()));
        Ok(())
    }

    fn attach_loop(&self, backing: &Path) -> Result<PathBuf, HostError> {
        self.check("attach")?;
        self.record(Call::Attach(backing.to_path_buf()));
        Ok(PathBuf::from("/dev/loop7"))
    }

    fn detach_loop(&self, device: &Path) -> Result<(), HostError> {
        self.check("detach")?;
        self.record(Call::Detach(device.to_path_buf()));
        Ok(())
    }

    fn partition_node(&self, device: &Path, number: usize) -> Result<PathBuf, HostError> {
        Ok(partition_path(device, number))
    }

    fn make_filesystem(&self, device: &Path, kind: FsKind, _label: &str) -> Result<(), HostError> {
        self.check(&format!("mkfs:{}", kind.fstype()))?;
        self.record(Call::Mkfs(device.to_path_buf(), kind));
        Ok(())
    }

    fn mount(&self, mount: &MountPoint) -> Result<(), HostError> {
        if !mount.target.is_dir() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }
        self.check_path("mount", &mount.target)?;
        self.mounted.borrow_mut().push(Mounted {
            target: mount.target.clone(),
            source: mount.source.clone(),
            fstype: mount.fstype.clone().unwrap_or_else(|| "none".to_owned()),
        });
        self.record(Call::Mount(mount.target.clone()));
        Ok(())
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<(), HostError> {
        self.check_path(if lazy { "umount-lazy" } else { "umount" }, target)?;
        let mut mounted = self.mounted.borrow_mut();
        let Some(pos) = mounted.iter().rposition(|m| m.target == target) else {
            return Err(std::io::Error::other("not mounted").into());
        };
        mounted.remove(pos);
        drop(mounted);
        self.record(Call::Unmount {
            target: target.to_path_buf(),
            lazy,
        });
        Ok(())
    }

    fn mounts_under(&self, dir: &Path) -> Result<Vec<PathBuf>, HostError> {
        Ok(self
            .mounted
            .borrow()
            .iter()
            .filter(|m| m.target.starts_with(dir))
            .map(|m| m.target.clone())
            .collect())
    }

    fn chroot_exec(&self, root: &Path, command: &CommandSpec) -> Result<String, HostError> {
        let program = command.argv.first().map_or("", String::as_str);
        self.check(&format!("chroot:{program}"))?;
        if program == "grub-mkconfig" {
            if let Some(out) = command.argv.iter().skip_while(|a| *a != "-o").nth(1) {
                std::fs::write(rooted(root, Path::new(out)), "# generated\n")?;
            }
        }
        self.record(Call::Chroot(command.clone()));
        Ok(String::new())
    }
}

impl IdentityProbe for FakeHost {
    fn backing_mount(
        &self,
        session: &ChrootSession,
        path: &Path,
    ) -> Result<Option<MountRecord>, IdentityError> {
        let target = rooted(&session.root, path);
        Ok(self
            .mounted
            .borrow()
            .iter()
            .rev()
            .find(|m| m.target == target)
            .map(|m| MountRecord {
                device: m.source.clone(),
                fstype: m.fstype.clone(),
            }))
    }

    fn uuid(&self, device: &Path) -> Result<Option<String>, IdentityError> {
        if self.fails_at("uuid", device) {
            return Ok(None);
        }
        Ok(device
            .file_name()
            .map(|name| format!("uuid-{}", name.to_string_lossy())))
    }
}

/// Write a small squashfs image into `dir` and return its path.
pub fn build_squashfs(dir: &Path) -> PathBuf {
    let dir_header = NodeHeader::new(0o755, 0, 0, 1_700_000_000);
    let file_header = NodeHeader::new(0o644, 0, 0, 1_700_000_000);
    let mut fs = FilesystemWriter::default();
    for d in ["etc", "usr", "usr/bin", "dev"] {
        fs.push_dir(d, dir_header).unwrap();
    }
    fs.push_file(std::io::Cursor::new(b"efimg\n".to_vec()), "etc/hostname", file_header)
        .unwrap();
    fs.push_file(
        std::io::Cursor::new(b"#!/bin/sh\necho hello\n".to_vec()),
        "usr/bin/hello",
        dir_header,
    )
    .unwrap();
    fs.push_file(std::io::Cursor::new(Vec::new()), "dev/placeholder", file_header)
        .unwrap();
    fs.push_symlink("/usr/share/zoneinfo/UTC", "etc/localtime", file_header)
        .unwrap();
    let path = dir.join("rootfs.squashfs");
    let mut out = File::create(&path).unwrap();
    fs.write(&mut out).unwrap();
    path
}
