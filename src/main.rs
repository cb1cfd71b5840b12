#![warn(rust_2018_idioms)]
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tracing_subscriber::prelude::*;

use efimg::backend::host::LinuxHost;
use efimg::backend::identity::MountTableProbe;
use efimg::backend::install::{Installer, Outcome};
use efimg::backend::privilege::Privileged;
use efimg::cfg::EfimgConfig;
use efimg::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "efimg", version)]
#[command(about = "Build a bootable EFI disk image from a squashfs root filesystem")]
#[command(after_help = "The image is written to efi.img in the working directory.
Settings are read from $EFIMG_CONFIG or /etc/efimg.toml.")]
struct Cli {
    /// Compressed root filesystem archive (squashfs)
    archive: PathBuf,
}

/// Parse and check arguments without touching anything.
///
/// `--help` and `--version` print and exit right here.
fn parse_args<I, T>(args: I) -> Result<Cli, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => return Err(Error::Usage(e.render().to_string())),
    };
    if !cli.archive.is_file() {
        return Err(Error::Usage(format!(
            "error: {:?} does not exist or is not a file\n\n{}",
            cli.archive,
            Cli::command().render_usage()
        )));
    }
    Ok(cli)
}

/// Load settings, then get root before anything else is set up: nothing survives a re-exec.
fn elevate() -> Result<(EfimgConfig, Privileged)> {
    let cfg = efimg::cfg::get_cfg()?;
    let privilege = Privileged::acquire(&cfg.privilege.helper)?;
    Ok((cfg, privilege))
}

fn main() -> ExitCode {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e.to_string().trim_end());
            return ExitCode::FAILURE;
        }
    };
    let (cfg, privilege) = match elevate() {
        Ok(elevated) => elevated,
        Err(e) => {
            eprintln!("Error: {e:?}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = match setup_logs_and_install_panic_hook() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:?}");
            return ExitCode::FAILURE;
        }
    };
    match run(&cli, &cfg, privilege) {
        Ok(outcome) => report(outcome),
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, cfg: &EfimgConfig, privilege: Privileged) -> Result<Outcome> {
    tracing::debug!(?cfg, "Loaded configuration");

    let archive = cli
        .archive
        .canonicalize()
        .wrap_err_with(|| format!("cannot resolve {:?}", cli.archive))?;
    let output = std::env::current_dir()
        .wrap_err("cannot read working directory")?
        .join(&cfg.image.output);

    let host = LinuxHost::new(privilege);
    let probe = MountTableProbe::default();
    let installer = Installer {
        host: &host,
        probe: &probe,
        cfg,
    };
    Ok(installer.run(&archive, &output))
}

/// Print the failing stage and, separately, anything teardown left behind.
fn report(outcome: Outcome) -> ExitCode {
    let built = match outcome.result {
        Ok(provisioned) => {
            info!(image = ?provisioned.image, "Done");
            for id in &provisioned.identities {
                info!("{} on UUID={}", id.mountpoint.display(), id.uuid);
            }
            true
        }
        Err(e) => {
            let stage = e.stage();
            eprintln!("Error: {stage} failed: {:?}", color_eyre::Report::new(e));
            false
        }
    };
    if let Err(e) = outcome.teardown {
        if built {
            warn!("Image was built, but cleaning up did not fully succeed");
        }
        eprintln!("Teardown: {:?}", color_eyre::Report::new(e));
    }
    if built {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn setup_logs_and_install_panic_hook() -> Result<impl std::any::Any> {
    color_eyre::install()?;
    let log_dir = tempfile::Builder::new()
        .prefix("efimg-logs")
        .tempdir()
        .wrap_err("cannot create log directory")?
        .keep();
    let file_appender = tracing_appender::rolling::never(&log_dir, "efimg.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let console_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    // journald is optional, containers and CI usually don't have it
    let journald = tracing_journald::layer()
        .ok()
        .map(|l| l.with_syslog_identifier("efimg".to_owned()));
    let has_journald = journald.is_some();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact()
                .with_filter(tracing::level_filters::LevelFilter::TRACE),
        )
        .with(journald)
        .try_init()
        .wrap_err("cannot set global subscriber")?;
    tracing::info!("efimg {version}", version = env!("CARGO_PKG_VERSION"));
    if has_journald {
        tracing::debug!("Logging to journald");
    }
    tracing::info!("Logging to {}", log_dir.join("efimg.log").display());
    Ok(guard)
}
