//! Command-line front end for scan definitions.
//!
//! Usage:
//!   scan_runner inspect --config scan.toml            # Shape, size, first points
//!   scan_runner inspect --config scan.toml -n 20      # First 20 points
//!   scan_runner run --config scan.toml                # Execute on a mock positioner

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use daq_scanning::points::PointGenerator;
use daq_scanning::sequencer::{MockPositioner, Positioner, PositionerCache, ScanRunner};
use daq_scanning::watchdog::{
    ExpressionWatchdog, ObservableValue, RhaiExpressionService, SourceRegistry,
};
use daq_scanning::ScanConfig;

#[derive(Parser)]
#[command(name = "scan_runner")]
#[command(about = "Inspect and run scan trajectory definitions")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print shape, size and the first positions of a scan
    Inspect {
        /// Path to the scan definition (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of positions to print
        #[arg(short = 'n', long, default_value = "10")]
        points: usize,
    },
    /// Run a scan on a mock positioner, guarded by its watchdog if any
    Run {
        /// Path to the scan definition (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn inspect(config: &ScanConfig, points: usize) -> Result<()> {
    let scan = config.scan.build()?;
    println!("name:  {}", scan.name());
    println!("shape: {:?}", scan.shape()?);
    println!("rank:  {}", scan.rank()?);
    println!("size:  {}", scan.size()?);

    for position in scan.positions()?.take(points) {
        println!("{}", serde_json::to_string(&position?)?);
    }
    Ok(())
}

async fn run(config: &ScanConfig) -> Result<()> {
    let scan = config.scan.build()?;

    let cache = PositionerCache::new(config.cache.positioner_capacity)?;
    let timing = (
        Duration::from_millis(config.runner.move_ms),
        Duration::from_millis(config.runner.settle_ms),
    );
    let positioner = cache.get_or_create(&config.scan.name, || {
        let mock = MockPositioner::new("mock_positioner").with_timing(timing.0, timing.1);
        Ok(Arc::new(mock) as Arc<dyn Positioner>)
    })?;

    let mut sources = SourceRegistry::new();
    for (name, value) in &config.sources {
        sources.register(Arc::new(ObservableValue::new(name.clone(), value.clone())));
    }

    let runner = Arc::new(ScanRunner::new(config.application.name.clone()));
    let watchdog = match &config.scan.watchdog {
        Some(model) => {
            let watchdog = ExpressionWatchdog::new(
                model.clone(),
                runner.clone(),
                Arc::new(RhaiExpressionService::default()),
                sources,
            )?;
            let first = scan.first_point()?;
            watchdog
                .arm(first.as_ref())
                .await
                .context("Scan rejected by watchdog")?;
            Some(watchdog)
        }
        None => None,
    };

    let result = runner.run(&scan, positioner.as_ref()).await;
    if let Some(watchdog) = &watchdog {
        watchdog.disarm();
    }

    match result {
        Ok(summary) => {
            info!("Scan '{}' complete", scan.name());
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => {
            warn!("Scan '{}' failed: {}", scan.name(), e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Inspect { config, points } => {
            let config = ScanConfig::load(Some(config.as_path()))
                .with_context(|| format!("Cannot load {}", config.display()))?;
            init_tracing(&config.application.log_level);
            inspect(&config, points)
        }
        Command::Run { config } => {
            let config = ScanConfig::load(Some(config.as_path()))
                .with_context(|| format!("Cannot load {}", config.display()))?;
            init_tracing(&config.application.log_level);
            run(&config).await
        }
    }
}
