use crate::backend::chroot::{ChrootSession, ChrootStep, CommandSpec, SessionStep, StepContext};
use crate::backend::loopdev::LoopDevice;
use crate::cfg::Boot;
use crate::consts::{ESP_MOUNTPOINT, GRUB_CFG};
use crate::error::Error;
use crate::prelude::*;
use crate::util::fs::rooted;

/// Run `grub-mkconfig` inside the chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateGrubConfig {
    /// Path inside the chroot.
    pub output: PathBuf,
}

impl SessionStep for GenerateGrubConfig {
    fn kind(&self) -> ChrootStep {
        ChrootStep::GenerateBootConfig
    }

    fn run(&self, session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()> {
        if let Some(dir) = self.output.parent() {
            std::fs::create_dir_all(rooted(&session.root, dir)).map_err(|e| Error::ChrootCommand {
                step: self.kind(),
                source: HostError::Io(e).into(),
            })?;
        }
        let output = self.output.to_string_lossy();
        session.run(ctx.host, &CommandSpec::new(self.kind(), ["grub-mkconfig", "-o", &output]))?;
        Ok(())
    }
}

/// Arguments for `grub-install`, targeting `disk`.
#[must_use]
pub fn install_args(disk: &Path, boot: &Boot) -> Vec<String> {
    let mut args = vec![
        "grub-install".to_owned(),
        format!("--target={}", boot.target),
        format!("--efi-directory={ESP_MOUNTPOINT}"),
        "--boot-directory=/boot".to_owned(),
    ];
    if boot.removable {
        args.push("--removable".to_owned());
    }
    if !boot.update_nvram {
        args.push("--no-nvram".to_owned());
    }
    if let Some(id) = &boot.bootloader_id {
        args.push(format!("--bootloader-id={id}"));
    }
    args.push(disk.to_string_lossy().into_owned());
    args
}

/// Install GRUB's EFI image into the ESP of the image behind `disk`.
///
/// # Errors
/// - the boot configuration or the ESP mount point is missing
/// - `grub-install` fails
#[tracing::instrument(skip(host, session, disk, boot), fields(disk = ?disk.path))]
pub fn install(
    host: &dyn Host,
    session: &ChrootSession,
    disk: &LoopDevice,
    boot: &Boot,
) -> Result<()> {
    for (path, what) in [(GRUB_CFG, "boot configuration"), (ESP_MOUNTPOINT, "EFI directory")] {
        if !rooted(&session.root, Path::new(path)).exists() {
            return Err(Error::Bootloader {
                reason: format!("{what} {path} is missing from the image"),
                source: None,
            });
        }
    }
    let spec = CommandSpec::new(ChrootStep::InstallBootloader, install_args(&disk.path, boot));
    session.exec(host, &spec).map_err(|source| Error::Bootloader {
        reason: format!("grub-install onto {} failed", disk.path.display()),
        source: Some(source),
    })?;
    info!("Installed GRUB");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::image::Image;
    use crate::backend::mounts::{mount_tree, MountStack};
    use crate::backend::testing::{Call, FakeHost};
    use bytesize::ByteSize;

    #[test]
    fn default_args() {
        assert_eq!(
            install_args(Path::new("/dev/loop7"), &Boot::default()),
            [
                "grub-install".to_owned(),
                format!("--target={}", crate::consts::grub_target()),
                "--efi-directory=/boot/efi".into(),
                "--boot-directory=/boot".into(),
                "--removable".into(),
                "--no-nvram".into(),
                "/dev/loop7".into(),
            ]
        );
    }

    #[test]
    fn needs_boot_config() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::default();
        let mut stack = MountStack::default();
        mount_tree(
            &host,
            &mut stack,
            dir.path(),
            Path::new("/dev/loop7p2"),
            Path::new("/dev/loop7p1"),
        )
        .unwrap();
        let binds = stack.iter().filter(|m| m.bind).map(|m| m.target.clone()).collect();
        let session = ChrootSession::new(dir.path().to_path_buf(), binds);
        let image =
            Image::efi_layout(dir.path().join("efi.img"), ByteSize::gib(8), ByteSize::mib(256));
        let disk = LoopDevice::attach(&host, image).unwrap();

        let err = install(&host, &session, &disk, &Boot::default()).unwrap_err();
        assert!(matches!(err, Error::Bootloader { source: None, .. }));

        let mut ctx = StepContext {
            host: &host,
            probe: &host,
            identities: vec![],
        };
        GenerateGrubConfig {
            output: GRUB_CFG.into(),
        }
        .run(&session, &mut ctx)
        .unwrap();
        assert!(dir.path().join("boot/grub/grub.cfg").exists());

        install(&host, &session, &disk, &Boot::default()).unwrap();
        let Some(Call::Chroot(spec)) = host.calls().pop() else {
            panic!("grub-install did not run");
        };
        assert_eq!(spec.step, ChrootStep::InstallBootloader);
        assert_eq!(spec.argv.last().map(String::as_str), Some("/dev/loop7"));
    }
}
