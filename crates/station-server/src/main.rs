use anyhow::Context;
use clap::Parser;
use station_config::{ConfigLoader, DestinationKind};
use station_core::{ConfigSource, FileConfigSource, Station};
use station_logging::init_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

mod drivers;
mod transports;

use drivers::{CommandDriver, ConfiguredProbe};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "station.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new(&args.config);
    let config = loader
        .load()
        .with_context(|| format!("Invalid configuration {}", args.config.display()))?;

    if args.check {
        let resolved = ConfigLoader::resolve_devices(&config);
        println!(
            "{}: {} device(s), {} destination(s)",
            args.config.display(),
            resolved.devices.len(),
            config.destinations.len()
        );
        for (identifier, err) in &resolved.rejected {
            println!("  rejected {identifier}: {err}");
        }
        if !resolved.rejected.is_empty() {
            anyhow::bail!("{} device(s) rejected", resolved.rejected.len());
        }
        return Ok(());
    }

    let _logging = init_logging(&config.logging)?;
    info!(
        config = %args.config.display(),
        station = %config.station.name,
        data_dir = %config.station.data_dir.display(),
        "Starting capture station"
    );

    let source: Arc<dyn ConfigSource> = Arc::new(FileConfigSource::new(&args.config));
    let station = Station::builder()
        .with_config(config)
        .with_config_source(FileConfigSource::new(&args.config))
        .with_probe(ConfiguredProbe::new(source))
        .with_driver_factory(Arc::new(CommandDriver))
        .with_transport(DestinationKind::Sftp, transports::connect_sftp)
        .with_transport(DestinationKind::Ftp, transports::connect_ftp)
        .start()
        .await?;

    station.stop_signal().forward_system_signals();
    let report = station.wait().await;
    if !report.all_completed() {
        warn!(stages = ?report.stages, "Shutdown incomplete");
    }
    info!(reason = ?report.reason, elapsed = ?report.elapsed, "Capture station stopped");
    Ok(())
}
