use crate::backend::image::{Image, PartitionRole};
use crate::error::Error;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Detached,
    Attached,
}

/// A backing image exposed as a kernel block device.
///
/// Attached exactly once by [`LoopDevice::attach`]; [`LoopDevice::detach`] may be called
/// any number of times and only talks to the host the first time.
#[derive(Debug)]
pub struct LoopDevice {
    pub path: PathBuf,
    state: LoopState,
    image: Image,
}

impl LoopDevice {
    /// # Errors
    /// - no free loop device, or `losetup` fails otherwise
    #[tracing::instrument(skip(host, image), fields(image = ?image.path))]
    pub fn attach(host: &dyn Host, image: Image) -> Result<Self> {
        let path = host.attach_loop(&image.path).map_err(|source| Error::Attach {
            image: image.path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            state: LoopState::Attached,
            image,
        })
    }

    #[must_use]
    pub const fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub const fn image(&self) -> &Image {
        &self.image
    }

    /// Wait for every partition node of the attached image and record it.
    ///
    /// # Errors
    /// - the device is detached
    /// - a partition node never shows up
    #[tracing::instrument(skip(self, host), fields(device = ?self.path))]
    pub fn resolve_partitions(&mut self, host: &dyn Host) -> Result<()> {
        let image_path = self.image.path.clone();
        if self.state == LoopState::Detached {
            return Err(Error::Attach {
                image: image_path,
                source: std::io::Error::other("loop device is not attached").into(),
            });
        }
        for (i, part) in self.image.partitions.iter_mut().enumerate() {
            let node = host
                .partition_node(&self.path, i + 1)
                .map_err(|source| Error::Attach {
                    image: image_path.clone(),
                    source,
                })?;
            debug!(role = %part.role, ?node, "Found partition node");
            part.node = Some(node);
        }
        Ok(())
    }

    /// Node of the partition playing `role`, if resolved.
    #[must_use]
    pub fn partition_node(&self, role: PartitionRole) -> Option<&Path> {
        (self.state == LoopState::Attached)
            .then(|| self.image.partition(role)?.node.as_deref())
            .flatten()
    }

    /// Detach from the kernel. A no-op on an already detached device.
    ///
    /// # Errors
    /// - `losetup --detach` fails; the device stays marked attached
    #[tracing::instrument(skip(self, host), fields(device = ?self.path))]
    pub fn detach(&mut self, host: &dyn Host) -> Result<(), HostError> {
        if self.state == LoopState::Detached {
            trace!("Already detached");
            return Ok(());
        }
        host.detach_loop(&self.path)?;
        self.state = LoopState::Detached;
        for part in &mut self.image.partitions {
            part.node = None;
        }
        info!("Detached loop device");
        Ok(())
    }
}
