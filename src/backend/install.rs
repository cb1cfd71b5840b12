//! The provisioning pipeline: image, loop device, filesystems, mounts, contents,
//! customization, bootloader. Teardown always runs afterwards.
use scopeguard::ScopeGuard;

use crate::backend::chroot::{run_steps, ChrootSession, Step, StepContext};
use crate::backend::format::{format, FsKind};
use crate::backend::grub;
use crate::backend::identity::{FilesystemIdentity, IdentityProbe};
use crate::backend::image::{Image, PartitionRole};
use crate::backend::loopdev::LoopDevice;
use crate::backend::mounts::mount_tree;
use crate::backend::populate::populate;
use crate::backend::teardown::Teardown;
use crate::cfg::EfimgConfig;
use crate::consts::{ESP_LABEL, ROOT_LABEL};
use crate::error::{Error, TeardownError};
use crate::prelude::*;
use crate::stage;

/// What a successful run leaves behind.
#[derive(Debug)]
pub struct Provisioned {
    pub image: PathBuf,
    /// Root first, then the ESP, as written to fstab.
    pub identities: Vec<FilesystemIdentity>,
}

/// Result of the pipeline and, separately, of the teardown that followed it.
#[derive(Debug)]
pub struct Outcome {
    pub result: Result<Provisioned>,
    pub teardown: Result<(), TeardownError>,
}

impl Outcome {
    /// Teardown failures after a successful run are only warnings.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Installer<'a> {
    pub host: &'a dyn Host,
    pub probe: &'a dyn IdentityProbe,
    pub cfg: &'a EfimgConfig,
}

impl Installer<'_> {
    /// Build the image at `output` from the squashfs at `archive`.
    ///
    /// Fails fast on the first error; whatever was acquired up to that point is released
    /// before returning, and on unwinding too.
    #[tracing::instrument(skip(self))]
    pub fn run(&self, archive: &Path, output: &Path) -> Outcome {
        let mut td = scopeguard::guard(Teardown::new(self.host), |mut td| {
            if let Err(e) = td.run() {
                error!("Teardown during unwind failed: {e}");
            }
        });
        let result = self.provision(archive, output, &mut td);
        if let Err(e) = &result {
            error!(stage = e.stage(), "Provisioning failed: {e}");
        }
        let teardown = stage!("Tearing down" { ScopeGuard::into_inner(td).run() });
        Outcome { result, teardown }
    }

    fn provision(
        &self,
        archive: &Path,
        output: &Path,
        td: &mut Teardown<'_>,
    ) -> Result<Provisioned> {
        let cfg = &self.cfg.image;
        let image = Image::efi_layout(output.to_path_buf(), cfg.size, cfg.esp_size);
        stage!("Allocating image" {
            image.allocate(self.host, cfg.sparse)?;
        });

        let root = stage!("Creating mount root" { self.make_mount_root()? });
        td.track_mount_root(root.clone());

        let (esp_node, root_node) = stage!("Attaching loop device" {
            let dev = td.track_loop(LoopDevice::attach(self.host, image)?);
            dev.resolve_partitions(self.host)?;
            (node(dev, PartitionRole::Esp)?, node(dev, PartitionRole::Root)?)
        });

        stage!("Formatting partitions" {
            format(self.host, &esp_node, FsKind::Fat32, ESP_LABEL)?;
            format(self.host, &root_node, FsKind::Ext4, ROOT_LABEL)?;
        });

        stage!("Mounting filesystems" {
            mount_tree(self.host, td.mounts(), &root, &root_node, &esp_node)?;
        });
        let binds = td.mounts().iter().filter(|m| m.bind).map(|m| m.target.clone()).collect_vec();
        let targets = td.mounts().iter().map(|m| m.target.clone()).collect_vec();

        stage!("Extracting files" {
            let mut reported = 0;
            populate(archive, &root, &binds, &targets, |done, total| {
                let pct = done * 100 / total.max(1);
                if pct >= reported + 10 {
                    reported = pct - pct % 10;
                    info!("Extracted {pct}% ({done}/{total})");
                }
            })?;
        });

        let session = ChrootSession::new(root, binds);
        let mut ctx = StepContext {
            host: self.host,
            probe: self.probe,
            identities: vec![],
        };
        stage!("Customizing system" {
            run_steps(&Step::sequence(self.cfg), &session, &mut ctx)?;
        });

        stage!("Installing bootloader" {
            let Some(disk) = td.loop_device() else {
                return Err(Error::Bootloader {
                    reason: "no loop device attached".into(),
                    source: None,
                });
            };
            grub::install(self.host, &session, disk, &self.cfg.boot)?;
        });

        info!(image = ?output, "Image ready");
        Ok(Provisioned {
            image: output.to_path_buf(),
            identities: ctx.identities,
        })
    }

    /// A fresh directory under the configured workdir, by its resolved path.
    fn make_mount_root(&self) -> Result<PathBuf> {
        let parent = self.cfg.image.workdir.clone().unwrap_or_else(std::env::temp_dir);
        let mount_err = |e: std::io::Error| Error::Mount {
            device: PathBuf::new(),
            target: parent.clone(),
            source: e.into(),
        };
        // the kernel lists mounts with symlinks resolved
        let resolved = parent.canonicalize().map_err(mount_err)?;
        let dir = tempfile::Builder::new()
            .prefix("efimg.")
            .tempdir_in(&resolved)
            .map_err(mount_err)?;
        // removal is up to teardown, and only once nothing is mounted below it
        let dir = dir.keep();
        debug!(?dir, "Created mount root");
        Ok(dir)
    }
}

fn node(dev: &LoopDevice, role: PartitionRole) -> Result<PathBuf> {
    dev.partition_node(role)
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Attach {
            image: dev.image().path.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no {role} partition on {}", dev.path.display()),
            )
            .into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fstab::MountTable;
    use crate::backend::identity::MountTableProbe;
    use crate::backend::testing::{build_squashfs, Call, FakeHost};
    use bytesize::ByteSize;

    fn config(workdir: &Path) -> EfimgConfig {
        let mut cfg = EfimgConfig::default();
        cfg.image.size = ByteSize::mib(64);
        cfg.image.esp_size = ByteSize::mib(16);
        cfg.image.workdir = Some(workdir.to_path_buf());
        cfg
    }

    fn leftover_roots(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with("efimg.")))
            .collect()
    }

    /// Everything acquired got released, exactly once.
    fn assert_released(host: &FakeHost) {
        assert!(host.mounted().is_empty());
        assert_eq!(
            host.count(|c| matches!(c, Call::Attach(_))),
            host.count(|c| matches!(c, Call::Detach(_)))
        );
        assert!(host.count(|c| matches!(c, Call::Attach(_))) <= 1);
    }

    #[test]
    fn builds_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_squashfs(dir.path());
        let cfg = config(dir.path());
        let host = FakeHost::default();
        let installer = Installer {
            host: &host,
            probe: &host,
            cfg: &cfg,
        };
        let output = dir.path().join("efi.img");

        let outcome = installer.run(&archive, &output);
        let provisioned = outcome.result.unwrap();
        outcome.teardown.unwrap();

        assert_eq!(provisioned.image, output);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), ByteSize::mib(64).as_u64());
        let paths = provisioned.identities.iter().map(|i| i.mountpoint.clone()).collect_vec();
        assert_eq!(paths, [PathBuf::from("/"), "/boot/efi".into()]);
        assert_eq!(
            host.calls()
                .iter()
                .filter_map(|c| match c {
                    Call::Mkfs(dev, kind) => Some((dev.clone(), *kind)),
                    _ => None,
                })
                .collect_vec(),
            [
                (PathBuf::from("/dev/loop7p1"), FsKind::Fat32),
                ("/dev/loop7p2".into(), FsKind::Ext4),
            ]
        );
        let programs = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Chroot(spec) => Some(spec.argv[0].clone()),
                _ => None,
            })
            .collect_vec();
        assert_eq!(programs, ["apt-get", "locale-gen", "apt-get", "grub-mkconfig", "grub-install"]);
        assert_released(&host);
        assert!(leftover_roots(dir.path()).is_empty());
    }

    #[test]
    fn writes_two_fstab_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_squashfs(dir.path());
        let cfg = config(dir.path());
        let host = FakeHost::default();
        let installer = Installer {
            host: &host,
            probe: &host,
            cfg: &cfg,
        };
        let mut td = Teardown::new(&host);
        installer
            .provision(&archive, &dir.path().join("efi.img"), &mut td)
            .unwrap();

        let roots = leftover_roots(dir.path());
        let [root] = &roots[..] else {
            panic!("expected one mount root");
        };
        let table = MountTable::read(&root.join("etc/fstab")).unwrap();
        let entries = table
            .entries
            .iter()
            .map(|e| (e.device_spec.as_str(), e.mountpoint.as_str(), e.options.join(",")))
            .collect_vec();
        assert_eq!(
            entries,
            [
                ("UUID=uuid-loop7p2", "/", "errors=remount-ro".to_owned()),
                ("UUID=uuid-loop7p1", "/boot/efi", "umask=0077".to_owned()),
            ]
        );
        td.run().unwrap();
        assert_released(&host);
    }

    #[test]
    fn mount_root_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let cfg = config(&link);
        let host = FakeHost::default();
        let installer = Installer {
            host: &host,
            probe: &host,
            cfg: &cfg,
        };

        let root = installer.make_mount_root().unwrap();
        assert_eq!(root.parent().unwrap(), real.canonicalize().unwrap());

        // as /proc/self/mounts would list it
        let mounts = dir.path().join("mounts");
        std::fs::write(&mounts, format!("/dev/loop3p2 {} ext4 rw 0 0\n", root.display())).unwrap();
        let probe = MountTableProbe { table: mounts };
        let session = ChrootSession::new(root, vec![]);
        let record = probe.backing_mount(&session, Path::new("/")).unwrap().unwrap();
        assert_eq!(record.device, Path::new("/dev/loop3p2"));
    }

    #[test]
    fn corrupt_archive_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.squashfs");
        std::fs::write(&archive, vec![0x55; 4096]).unwrap();
        let cfg = config(dir.path());
        let host = FakeHost::default();
        let installer = Installer {
            host: &host,
            probe: &host,
            cfg: &cfg,
        };

        let outcome = installer.run(&archive, &dir.path().join("efi.img"));
        assert!(!outcome.success());
        assert!(matches!(outcome.result, Err(Error::Populate { .. })));
        outcome.teardown.unwrap();
        assert_eq!(host.count(|c| matches!(c, Call::Unmount { .. })), 5);
        assert_eq!(host.count(|c| matches!(c, Call::Chroot(_))), 0);
        assert_released(&host);
        assert!(leftover_roots(dir.path()).is_empty());
    }

    #[test]
    fn unmounts_in_reverse_of_mount_order() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_squashfs(dir.path());
        let cfg = config(dir.path());
        let host = FakeHost::default();
        let installer = Installer {
            host: &host,
            probe: &host,
            cfg: &cfg,
        };
        installer.run(&archive, &dir.path().join("efi.img")).result.unwrap();

        let calls = host.calls();
        let mounted = calls
            .iter()
            .filter_map(|c| match c {
                Call::Mount(target) => Some(target.clone()),
                _ => None,
            })
            .collect_vec();
        let unmounted = calls
            .iter()
            .filter_map(|c| match c {
                Call::Unmount { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect_vec();
        assert_eq!(mounted.len(), 5);
        assert_eq!(unmounted, mounted.into_iter().rev().collect_vec());
    }

    #[test]
    fn every_failure_point_detaches_once() {
        for fail in [
            "partition",
            "attach",
            "mkfs:vfat",
            "mkfs:ext4",
            "mount:efi",
            "mount:sys",
            "chroot:apt-get",
            "chroot:locale-gen",
            "chroot:grub-mkconfig",
            "chroot:grub-install",
        ] {
            let dir = tempfile::tempdir().unwrap();
            let archive = build_squashfs(dir.path());
            let cfg = config(dir.path());
            let host = FakeHost::default();
            host.fail_on(fail);
            let installer = Installer {
                host: &host,
                probe: &host,
                cfg: &cfg,
            };
            let outcome = installer.run(&archive, &dir.path().join("efi.img"));
            assert!(outcome.result.is_err(), "{fail} should fail the run");
            outcome.teardown.unwrap();
            assert_released(&host);
            assert!(leftover_roots(dir.path()).is_empty(), "{fail} left a mount root");
        }
    }

    #[test]
    fn failures_are_attributed_to_their_stage() {
        let cases = [
            ("attach", "loop device attach"),
            ("mkfs:ext4", "filesystem formatting"),
            ("chroot:locale-gen", "chroot customization"),
            ("chroot:grub-install", "bootloader installation"),
        ];
        for (fail, stage) in cases {
            let dir = tempfile::tempdir().unwrap();
            let archive = build_squashfs(dir.path());
            let cfg = config(dir.path());
            let host = FakeHost::default();
            host.fail_on(fail);
            let installer = Installer {
                host: &host,
                probe: &host,
                cfg: &cfg,
            };
            let err = installer
                .run(&archive, &dir.path().join("efi.img"))
                .result
                .unwrap_err();
            assert_eq!(err.stage(), stage);
        }
    }

    #[test]
    fn teardown_failure_is_reported_separately() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_squashfs(dir.path());
        let cfg = config(dir.path());
        let host = FakeHost::default();
        host.fail_on("umount:dev");
        host.fail_on("umount-lazy:dev");
        let installer = Installer {
            host: &host,
            probe: &host,
            cfg: &cfg,
        };
        let outcome = installer.run(&archive, &dir.path().join("efi.img"));
        assert!(outcome.success());
        let err = outcome.teardown.unwrap_err();
        // the stuck bind and the mount root it pins
        assert_eq!(err.failures.len(), 2);
        assert_eq!(host.count(|c| matches!(c, Call::Detach(_))), 1);
    }
}
