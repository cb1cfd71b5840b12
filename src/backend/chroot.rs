//! Commands run inside the mounted image, with the image's root as their filesystem root.
use std::fmt;

use enum_dispatch::enum_dispatch;

use crate::backend::grub::GenerateGrubConfig;
use crate::backend::identity::{FilesystemIdentity, IdentityProbe, WriteFstab};
use crate::cfg::EfimgConfig;
use crate::consts::GRUB_CFG;
use crate::error::Error;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChrootStep {
    RemoveInstallerPackages,
    RegenerateLocales,
    WriteFstab,
    InstallBootPackages,
    GenerateBootConfig,
    InstallBootloader,
}

impl fmt::Display for ChrootStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RemoveInstallerPackages => "remove-installer-packages",
            Self::RegenerateLocales => "regenerate-locales",
            Self::WriteFstab => "write-fstab",
            Self::InstallBootPackages => "install-boot-packages",
            Self::GenerateBootConfig => "generate-boot-config",
            Self::InstallBootloader => "install-bootloader",
        })
    }
}

/// One command to run inside a [`ChrootSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub step: ChrootStep,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(step: ChrootStep, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            step,
            argv: argv.into_iter().map(Into::into).collect(),
            env: vec![],
        }
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_owned(), value.to_owned()));
        self
    }

    fn apt<'a>(step: ChrootStep, args: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(step, ["apt-get"].into_iter().chain(args))
            .env("DEBIAN_FRONTEND", "noninteractive")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("{0:?} is not mounted, refusing to run commands in the chroot")]
    MissingBind(PathBuf),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// The mounted image root together with the host binds that must be live before anything
/// runs in it.
#[derive(Debug, Clone)]
pub struct ChrootSession {
    pub root: PathBuf,
    /// Bind targets, as paths on the host.
    pub binds: Vec<PathBuf>,
}

impl ChrootSession {
    #[must_use]
    pub const fn new(root: PathBuf, binds: Vec<PathBuf>) -> Self {
        Self { root, binds }
    }

    /// # Errors
    /// - a required bind is not mounted right now
    pub fn verify(&self, host: &dyn Host) -> Result<(), SessionError> {
        let mounted = host.mounts_under(&self.root)?;
        match self.binds.iter().find(|b| !mounted.contains(b)) {
            Some(missing) => Err(SessionError::MissingBind(missing.clone())),
            None => Ok(()),
        }
    }

    /// Run `command` chrooted into the session root, returning its stdout.
    ///
    /// # Errors
    /// - see [`ChrootSession::verify`]
    /// - the command cannot be spawned or exits unsuccessfully
    #[tracing::instrument(skip(self, host, command), fields(step = %command.step))]
    pub fn exec(&self, host: &dyn Host, command: &CommandSpec) -> Result<String, SessionError> {
        self.verify(host)?;
        info!(argv = ?command.argv, "Running in chroot");
        Ok(host.chroot_exec(&self.root, command)?)
    }

    /// [`ChrootSession::exec`], reported as a failure of the command's step.
    ///
    /// # Errors
    /// - see [`ChrootSession::exec`]
    pub fn run(&self, host: &dyn Host, command: &CommandSpec) -> Result<String> {
        self.exec(host, command).map_err(|source| Error::ChrootCommand {
            step: command.step,
            source,
        })
    }
}

/// State shared by the customization steps.
pub struct StepContext<'a> {
    pub host: &'a dyn Host,
    pub probe: &'a dyn IdentityProbe,
    /// Filled in by [`WriteFstab`].
    pub identities: Vec<FilesystemIdentity>,
}

#[enum_dispatch(Step)]
pub trait SessionStep {
    fn kind(&self) -> ChrootStep;
    fn run(&self, session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()>;
}

#[enum_dispatch]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    RemovePackages,
    RegenerateLocales,
    WriteFstab,
    InstallPackages,
    GenerateGrubConfig,
}

impl Step {
    /// The customization sequence, in the order it has to run.
    #[must_use]
    pub fn sequence(cfg: &EfimgConfig) -> Vec<Self> {
        vec![
            RemovePackages {
                packages: cfg.packages.remove.clone(),
            }
            .into(),
            RegenerateLocales {
                command: cfg.packages.locale_command.clone(),
            }
            .into(),
            WriteFstab.into(),
            InstallPackages {
                packages: cfg.packages.install.clone(),
            }
            .into(),
            GenerateGrubConfig {
                output: GRUB_CFG.into(),
            }
            .into(),
        ]
    }
}

/// Run every step in order, stopping at the first failure.
///
/// # Errors
/// - the first step that fails
pub fn run_steps(steps: &[Step], session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()> {
    for step in steps {
        let span = tracing::info_span!("step", name = %step.kind());
        let _guard = span.enter();
        step.run(session, ctx)?;
    }
    Ok(())
}

/// Purge packages that only belong on the live medium, and whatever they pulled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePackages {
    pub packages: Vec<String>,
}

impl SessionStep for RemovePackages {
    fn kind(&self) -> ChrootStep {
        ChrootStep::RemoveInstallerPackages
    }

    fn run(&self, session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.packages.is_empty() {
            debug!("Nothing to remove");
            return Ok(());
        }
        let args = ["purge", "-y", "--autoremove"]
            .into_iter()
            .chain(self.packages.iter().map(String::as_str));
        session.run(ctx.host, &CommandSpec::apt(self.kind(), args))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerateLocales {
    pub command: Vec<String>,
}

impl SessionStep for RegenerateLocales {
    fn kind(&self) -> ChrootStep {
        ChrootStep::RegenerateLocales
    }

    fn run(&self, session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()> {
        session.run(ctx.host, &CommandSpec::new(self.kind(), &self.command))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPackages {
    pub packages: Vec<String>,
}

impl SessionStep for InstallPackages {
    fn kind(&self) -> ChrootStep {
        ChrootStep::InstallBootPackages
    }

    fn run(&self, session: &ChrootSession, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.packages.is_empty() {
            debug!("Nothing to install");
            return Ok(());
        }
        let args = ["install", "-y"]
            .into_iter()
            .chain(self.packages.iter().map(String::as_str));
        session.run(ctx.host, &CommandSpec::apt(self.kind(), args))?;
        Ok(())
    }
}
