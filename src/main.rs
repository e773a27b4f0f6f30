//! BPM test harness runner
//!
//! Loads the harness configuration, connects the bench, runs the configured
//! sweeps in order and writes the report.
//!
//! # Usage
//!
//! ```bash
//! # Lab run against the instruments in the configuration file
//! bpm_harness --config config/harness.toml
//!
//! # Dry run with every device simulated and no settling delay
//! bpm_harness --simulate --settling-time 0 --output-dir /tmp/bpm
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use bpm_harness::config::{HarnessConfig, DEFAULT_CONFIG_PATH};
use bpm_harness::devices::build_bench;
use bpm_harness::logging;
use bpm_harness::report::TestReport;
use bpm_harness::sweeps::run_sweeps;

/// Characterise BPM electronics against synthetic RF stimuli
#[derive(Parser, Debug)]
#[command(name = "bpm_harness")]
#[command(about = "Run BPM characterisation sweeps and write a report")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Report directory, overriding the configuration
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Settling time in seconds, overriding the configuration
    #[arg(long)]
    settling_time: Option<f64>,

    /// Replace every configured device with its simulated counterpart
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = HarnessConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    if args.simulate {
        config = config.into_simulated();
    }
    if let Some(settling) = args.settling_time {
        config.application.settling_time_s = settling;
    }
    if let Some(dir) = args.output_dir {
        config.application.output_dir = dir;
    }
    config.validate()?;

    logging::init_from_config(&config.application, args.json_logs)?;
    info!(
        config = %args.config.display(),
        sweeps = config.sweeps.len(),
        simulate = args.simulate,
        "Starting BPM test harness"
    );

    let bench = build_bench(&config.devices, None).await?;

    let mut report = TestReport::new(&config.application.name, &config.application.author);
    run_sweeps(
        &bench,
        &config.sweeps,
        config.application.settling_time()?,
        &mut report,
    )
    .await;

    let written = report.write_to_dir(&config.application.output_dir)?;
    info!(
        dir = %config.application.output_dir.display(),
        files = written.len(),
        passed = report.passed_count(),
        failed = report.failed_count(),
        "Report complete"
    );

    if report.failed_count() > 0 {
        error!(failed = report.failed_count(), "Some sweeps failed");
        std::process::exit(1);
    }
    Ok(())
}
