//! Releases everything a run acquired, in reverse, whether or not the run succeeded.
use crate::backend::loopdev::LoopDevice;
use crate::backend::mounts::MountStack;
use crate::error::{TeardownError, TeardownFailure};
use crate::prelude::*;

/// Owner of every resource acquired during a run.
///
/// Resources are registered right after they are acquired; [`Teardown::run`] releases
/// all of them and keeps going past failures.
pub struct Teardown<'h> {
    host: &'h dyn Host,
    mounts: MountStack,
    loop_device: Option<LoopDevice>,
    mount_root: Option<PathBuf>,
}

impl<'h> Teardown<'h> {
    #[must_use]
    pub fn new(host: &'h dyn Host) -> Self {
        Self {
            host,
            mounts: MountStack::default(),
            loop_device: None,
            mount_root: None,
        }
    }

    pub fn track_mount_root(&mut self, dir: PathBuf) {
        self.mount_root = Some(dir);
    }

    pub fn track_loop(&mut self, device: LoopDevice) -> &mut LoopDevice {
        self.loop_device.insert(device)
    }

    pub fn loop_device(&self) -> Option<&LoopDevice> {
        self.loop_device.as_ref()
    }

    pub fn mounts(&mut self) -> &mut MountStack {
        &mut self.mounts
    }

    /// Unmount the stack, detach the loop device, then remove the mount root once nothing
    /// is mounted below it anymore.
    ///
    /// Safe to call more than once.
    ///
    /// # Errors
    /// - every release action that failed
    #[tracing::instrument(skip_all)]
    pub fn run(&mut self) -> Result<(), TeardownError> {
        let mut failures = self.mounts.unmount_all(self.host);

        if let Some(dev) = &mut self.loop_device {
            if let Err(e) = dev.detach(self.host) {
                error!(device = ?dev.path, "Cannot detach loop device: {e}");
                failures.push(TeardownFailure {
                    action: format!("detach {}", dev.path.display()),
                    diagnostic: e.to_string(),
                });
            }
        }

        if let Some(root) = self.mount_root.take() {
            match self.remove_mount_root(&root) {
                Ok(()) => debug!(?root, "Removed mount root"),
                Err(diagnostic) => {
                    warn!(?root, "Keeping mount root: {diagnostic}");
                    failures.push(TeardownFailure {
                        action: format!("remove {}", root.display()),
                        diagnostic,
                    });
                    self.mount_root = Some(root);
                }
            }
        }

        if failures.is_empty() {
            info!("Teardown complete");
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    fn remove_mount_root(&self, root: &Path) -> Result<(), String> {
        if !self.mounts.is_empty() {
            return Err(format!("{} mount(s) still tracked", self.mounts.len()));
        }
        let live = self.host.mounts_under(root).map_err(|e| e.to_string())?;
        if !live.is_empty() {
            return Err(format!("still mounted: {}", live.iter().map(|p| p.display()).join(", ")));
        }
        crate::util::fs::exist_then(std::fs::remove_dir_all(root)).map_err(|e| e.to_string())
    }
}
