use std::path::PathBuf;

use itertools::Itertools;

use crate::backend::{
    chroot::{ChrootStep, SessionError}, format::FsKind, host::HostError, identity::IdentityError,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can stop a provisioning run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("cannot allocate image at {path:?}")]
    Allocation {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("cannot attach {image:?} to a loop device")]
    Attach {
        image: PathBuf,
        #[source]
        source: HostError,
    },

    #[error("cannot format {device:?} as {kind}")]
    Format {
        device: PathBuf,
        kind: FsKind,
        #[source]
        source: HostError,
    },

    #[error("cannot mount {device:?} on {target:?}")]
    Mount {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: HostError,
    },

    #[error("cannot populate root filesystem from {archive:?}")]
    Populate {
        archive: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("chroot step `{step}` failed")]
    ChrootCommand {
        step: ChrootStep,
        #[source]
        source: SessionError,
    },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("cannot install bootloader: {reason}")]
    Bootloader {
        reason: String,
        #[source]
        source: Option<SessionError>,
    },

    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

impl Error {
    /// Short name of the pipeline stage this error belongs to.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Usage(_) => "usage",
            Self::Allocation { .. } => "image allocation",
            Self::Attach { .. } => "loop device attach",
            Self::Format { .. } => "filesystem formatting",
            Self::Mount { .. } => "mount hierarchy",
            Self::Populate { .. } => "filesystem population",
            Self::ChrootCommand { .. } => "chroot customization",
            Self::Identity(_) => "identity resolution",
            Self::Bootloader { .. } => "bootloader installation",
            Self::Teardown(_) => "teardown",
        }
    }
}

/// One release action that could not be completed during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// What was being released, e.g. `unmount /tmp/efimg-x/dev`.
    pub action: String,
    pub diagnostic: String,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.action, self.diagnostic)
    }
}

/// Teardown keeps going after a failed release, so this carries all of them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{} teardown action(s) failed:\n{}", .failures.len(), .failures.iter().join("\n"))]
pub struct TeardownError {
    pub failures: Vec<TeardownFailure>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
