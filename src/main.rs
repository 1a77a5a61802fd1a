use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use base_drive_chain::can::{self, SlcanBus, slcan};
use base_drive_chain::config::{ConfigSource, DEFAULT_CONFIG_PATH, JsonConfig};
use base_drive_chain::platform::{Platform, PlatformConfig};

/// Motor coordination runtime for the wheeled base
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Platform configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port of the SLCAN adapter, overrides [bus] port
    #[arg(long)]
    port: Option<String>,

    /// Restart the drives without running the homing sequence
    #[arg(long)]
    skip_homing: bool,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn open_platform(args: &Args) -> Result<Platform, BoxError> {
    let source = JsonConfig::from_path(&args.config)?;
    let config = PlatformConfig::from_source(&source)?;

    let port = match &args.port {
        Some(port) => port.clone(),
        None => source.required_string("bus", "port")?,
    };
    let baudrate = source.optional_i64("bus", "baudrate", slcan::DEFAULT_BAUDRATE as i64)?;
    let bitrate = source.optional_i64("bus", "bitrate", slcan::DEFAULT_BITRATE as i64)?;

    info!("Opening SLCAN adapter on {} ({} bit/s)", port, bitrate);
    let bus = SlcanBus::open(&port, u32::try_from(baudrate)?, u32::try_from(bitrate)?)?;
    let platform = Platform::from_config(&config, can::shared(bus));
    info!(
        "Platform with {} wheels, {} of {} motors present",
        platform.wheel_count(),
        platform.present_count(),
        platform.node_count()
    );
    Ok(platform)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let platform = match open_platform(&args) {
        Ok(platform) => Arc::new(platform),
        Err(e) => {
            eprintln!("Startup error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = base_drive_chain::runtime::run(platform, args.skip_homing).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
