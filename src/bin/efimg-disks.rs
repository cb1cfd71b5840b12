//! List the disks on this machine with their partitions and sizes.
#![warn(rust_2018_idioms)]
use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use efimg::inventory::{DiskProbe, SysfsProbe};

#[derive(Parser)]
#[command(name = "efimg-disks", version)]
#[command(about = "Report block devices, their partitions and sizes")]
struct Cli {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();
    let cli = Cli::parse();

    let disks = SysfsProbe::default().probe().wrap_err("cannot list disks")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&disks)?);
        return Ok(());
    }
    for disk in &disks {
        println!(
            "{}: {} sectors of {} bytes, {} MB{}",
            disk.path.display(),
            disk.sector_count,
            disk.sector_size,
            disk.size_mb(),
            if disk.removable { " (removable)" } else { "" }
        );
        for part in &disk.partitions {
            println!(
                "  {}: sectors {}..={}, {} MB",
                part.path.display(),
                part.start,
                part.end,
                disk.partition_size_mb(part)
            );
        }
    }
    Ok(())
}
