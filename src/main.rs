//! `rig_services` command line.
//!
//! - `check`: load and validate configuration, then report each device's
//!   capabilities and disk preflight
//! - `simulate`: run every device's pretest against in-process services

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use rig_services::config::{ServicesConfig, DEFAULT_CONFIG_PATH};
use rig_services::coordinator::{ArtifactSink, ManifestCollector, RunCoordinator};
use rig_services::devices::simulated::SimulatedRig;
use rig_services::lifecycle::DiskCheck;
use rig_services::logging::{self, LogFormat};
use rig_services::metadata::SessionMetadataBuilder;

#[derive(Parser)]
#[command(name = "rig_services", about = "Drive the recording devices of an experiment rig", version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate configuration and report device capabilities and disk space
    Check,
    /// Pretest every device against simulated services
    Simulate {
        /// Experiment name recorded in the manifest
        #[arg(long, default_value = "pretest")]
        experiment: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServicesConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.application.log_level);
    let format: LogFormat = config.application.log_format.parse()?;
    logging::init(level, format)?;
    info!(app = %config.application.name, devices = config.enabled_devices().len(), "Configuration loaded");

    match cli.command {
        Command::Check => check(&config),
        Command::Simulate { experiment } => simulate(&config, &experiment).await,
    }
}

fn check(config: &ServicesConfig) -> Result<()> {
    let factory = Arc::new(SimulatedRig::for_devices(&config.devices));
    let mut coordinator = RunCoordinator::from_config(config, factory)?;
    for lifecycle in coordinator.devices_mut() {
        let capabilities = lifecycle.device_mut().capabilities();
        let disk = match lifecycle.check_disk() {
            DiskCheck::NotRequired => "not required".to_string(),
            DiskCheck::Sufficient { free_gb, required_gb } => {
                format!("ok ({free_gb} GB free, {required_gb} GB required)")
            }
            DiskCheck::Insufficient { free_gb, required_gb } => {
                format!("INSUFFICIENT ({free_gb} GB free, {required_gb} GB required)")
            }
            DiskCheck::Inaccessible { reason, .. } => format!("INACCESSIBLE ({reason})"),
        };
        println!("{}: {capabilities}; disk {disk}", lifecycle.name());
    }
    Ok(())
}

async fn simulate(config: &ServicesConfig, experiment: &str) -> Result<()> {
    let factory = Arc::new(SimulatedRig::for_devices(&config.devices));
    let mut coordinator = RunCoordinator::from_config(config, factory)?;
    let reports = coordinator.pretest_all().await;

    let metadata = SessionMetadataBuilder::new().experiment_name(experiment).build();
    let mut collector = ManifestCollector::new();
    for lifecycle in coordinator.devices() {
        collector.record(lifecycle.name(), lifecycle.session().artifacts(), &metadata)?;
    }
    coordinator.shutdown_all().await?;

    let failed: Vec<_> = reports.iter().filter(|r| !r.is_ok()).collect();
    for report in &reports {
        match &report.error {
            None => println!("{}: pretest passed", report.device),
            Some(err) => println!("{}: pretest FAILED: {err}", report.device),
        }
    }
    println!("{}", collector.manifest().to_json()?);
    if !failed.is_empty() {
        bail!("{} of {} pretests failed", failed.len(), reports.len());
    }
    Ok(())
}
