//! Test harness for characterising beam position monitor electronics.
//!
//! A BPM is fed synthetic beam signals: an RF generator stands in for the
//! beam, a gate source chops it into fill patterns and a four channel
//! attenuator shifts the power between the pickup buttons. Sweeps step one
//! of these stimuli and record what the BPM reports, then a report collects
//! the results.
//!
//! # Features
//!
//! - Capability traits for BPMs, RF sources, gate sources and attenuators
//! - Simulated devices for every capability
//! - Drivers for Rigol DSG3030, Mini-Circuits RC4DAT and Libera BPMs over
//!   Telnet/SCPI or EPICS channel access
//! - Power, fill pattern and beam position sweeps
//! - Markdown, JSON, CSV and Arrow report export
//!
//! # Example
//!
//! ```no_run
//! use bpm_harness::config::DevicesConfig;
//! use bpm_harness::devices::build_bench;
//! use bpm_harness::report::TestReport;
//! use bpm_harness::sweeps::{run_sweeps, PowerDependenceParams, SweepDefinition};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bench = build_bench(&DevicesConfig::simulated(), None).await?;
//!     let sweeps = vec![SweepDefinition::PowerDependence(PowerDependenceParams::default())];
//!     let mut report = TestReport::new("BPM Test Report", "Diagnostics Group");
//!     run_sweeps(&bench, &sweeps, Duration::from_secs(1), &mut report).await;
//!     report.write_to_dir("results".as_ref())?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod position;
pub mod report;
pub mod sweeps;
pub mod units;

pub use config::HarnessConfig;
pub use error::{AppResult, HarnessError};
pub use report::TestReport;
pub use sweeps::{run_sweeps, SweepDefinition, TestBench};
