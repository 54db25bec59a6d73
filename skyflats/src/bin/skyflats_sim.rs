//! Sky flats against a simulated observatory
//!
//! Runs a complete dusk or dawn flat-field sequence with simulated devices,
//! faster than real time, and prints the run summary as JSON.
//!
//! Usage:
//! ```text
//! cargo run --bin skyflats_sim -- --filter V --count 20 --twilight dawn --speed 120
//! ```
//!
//! Set `RUST_LOG=debug` for device level output.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use nightshade_skyflats::simulation::{SimulatedObservatory, SimulationConfig};
use nightshade_skyflats::{FlatFieldRunner, FlatFielder, FlatFielderConfig, RunnerConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exposure time function used when no configuration file is given
const DEFAULT_FUNCTION: &str = "exp(-0.9*(h+3.9))";

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TwilightArg {
    Dusk,
    Dawn,
}

#[derive(Parser, Debug)]
#[command(
    name = "skyflats_sim",
    about = "Take sky flats with a simulated telescope, camera and filter wheel",
    long_about = None
)]
struct Args {
    /// Filter to take flats in
    #[arg(short, long, default_value = "V")]
    filter: String,

    /// Number of flats to store
    #[arg(short = 'n', long, default_value_t = 20)]
    count: u32,

    /// Binning in both axes
    #[arg(short, long, default_value_t = 1)]
    binning: u32,

    /// Which twilight to simulate
    #[arg(short, long, value_enum, default_value_t = TwilightArg::Dusk)]
    twilight: TwilightArg,

    /// Simulated seconds per real second
    #[arg(short, long, default_value_t = 60.0)]
    speed: f64,

    /// Flat fielder configuration (JSON); defaults with the function
    /// exp(-0.9*(h+3.9)) for the selected filter if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the run log (CSV) to this file
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Give up after this many simulated seconds
    #[arg(long, default_value_t = 3600)]
    max_duration_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    if !(args.speed > 0.0) {
        anyhow::bail!("speed must be positive, got {}", args.speed);
    }

    let mut config = match &args.config {
        Some(path) => FlatFielderConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => FlatFielderConfig::default().with_function(args.filter.clone(), DEFAULT_FUNCTION),
    };
    if args.log.is_some() {
        config.log_path = args.log.clone();
    }
    // waits are real time, the sun moves in simulated time
    config.wait_interval_secs /= args.speed;

    let mut sim_config = match args.twilight {
        TwilightArg::Dusk => SimulationConfig::dusk(),
        TwilightArg::Dawn => SimulationConfig::dawn(),
    };
    sim_config.speed = args.speed;
    let obs = SimulatedObservatory::new(sim_config);

    tracing::info!(
        "Simulating {:?} starting {} with the sun at {:.2}°",
        args.twilight,
        obs.now(),
        obs.sun_altitude()
    );

    let fielder = FlatFielder::new(config, obs.sun.clone(), obs.clock.clone(), obs.image_store.clone())
        .context("Failed to set up flat fielder")?;

    let runner_config = RunnerConfig {
        max_duration_secs: ((args.max_duration_secs as f64 / args.speed).ceil() as u64).max(1),
        ..Default::default()
    };
    let mut runner = FlatFieldRunner::new(fielder, runner_config);

    let token = runner.abort_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting...");
            token.abort();
        }
    });

    let summary = runner
        .run(
            &obs.telescope,
            &obs.camera,
            &obs.filter_wheel,
            &args.filter,
            args.count,
            args.binning,
        )
        .await?;

    tracing::info!("Simulation ended at {} with the sun at {:.2}°", obs.now(), obs.sun_altitude());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
