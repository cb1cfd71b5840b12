use std::os::unix::process::CommandExt;
use std::process::Command;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

/// Set on the re-executed child so a helper that didn't actually grant root can't loop us.
const REEXEC_MARKER: &str = "EFIMG_REEXEC";
/// Environment worth carrying across the privilege boundary.
const PRESERVED_ENV: [&str; 3] = ["RUST_LOG", "EFIMG_CONFIG", "NO_COLOR"];

/// Proof that the process runs with an effective uid of 0.
///
/// The real [`LinuxHost`](crate::backend::host::LinuxHost) can only be built from one of
/// these, so every stage that touches devices or mounts states its privilege requirement
/// in its signature.
#[derive(Debug)]
pub struct Privileged(());

impl Privileged {
    #[must_use]
    pub fn check() -> Option<Self> {
        nix::unistd::geteuid().is_root().then_some(Self(()))
    }

    /// Return a token if already root, otherwise replace this process with itself run
    /// through `helper` (e.g. `sudo`).
    ///
    /// Must be called before any resource is acquired, log files included: nothing survives
    /// the re-exec.
    ///
    /// # Errors
    /// - the re-exec itself fails
    /// - we were already re-executed and still aren't root
    pub fn acquire(helper: &str) -> Result<Self> {
        if let Some(token) = Self::check() {
            return Ok(token);
        }
        if std::env::var_os(REEXEC_MARKER).is_some() {
            bail!("Still not running as root after re-executing through `{helper}`");
        }
        let exe = std::env::current_exe().wrap_err("cannot locate own executable")?;
        let cwd = std::env::current_dir().wrap_err("cannot read working directory")?;
        // logging is not up yet, and must not be before the re-exec
        eprintln!("efimg: not running as root, re-executing through `{helper}`");

        let mut cmd = Command::new(helper);
        // `env` so that sudo and pkexec alike keep our working directory and log settings
        cmd.arg("env").arg("-C").arg(&cwd).arg(format!("{REEXEC_MARKER}=1"));
        for key in PRESERVED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.arg(format!("{key}={value}"));
            }
        }
        cmd.arg(exe).args(std::env::args_os().skip(1));

        let err = cmd.exec();
        Err(err).wrap_err_with(|| format!("cannot re-execute through `{helper}`"))
    }
}
