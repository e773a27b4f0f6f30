//! Characterisation sweeps
//!
//! A sweep steps one stimulus (RF power, gate duty cycle or attenuation) and
//! records what the BPM reports after each step has settled. Every sweep
//! returns its typed result together with a [`ReportSection`] describing the
//! run.
//!
//! Sweeps only see the capability traits, so the same code drives lab
//! instruments and simulated devices. Devices are grouped into a
//! [`TestBench`]; [`SweepDefinition`] describes one configured sweep and
//! [`run_sweeps`] executes a list of them into a [`TestReport`].

pub mod beam_position;
pub mod fill_pattern;
pub mod power_dependence;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{AppResult, HarnessError};
use crate::hardware::{Attenuator, BpmDevice, GateSource, RfSource};
use crate::report::{ReportSection, TestReport};

pub use beam_position::{
    attenuation_permutation, equidistant_grid_raster, GridRasterParams, PermutationParams,
    PositionSweepResult,
};
pub use fill_pattern::{
    fixed_amplitude_fill_pattern, scaled_amplitude_fill_pattern, FillPatternParams,
    FillPatternResult, ScaledFillPatternParams,
};
pub use power_dependence::{beam_power_dependence, PowerDependenceParams, PowerDependenceResult};

/// Storage ring RF frequency used when a sweep does not name one (MHz)
pub const DEFAULT_RF_FREQUENCY_MHZ: f64 = 499.6817682;

/// The devices a sweep may drive
#[derive(Clone)]
pub struct TestBench {
    /// RF signal generator feeding the BPM
    pub rf: Arc<dyn RfSource>,
    /// BPM under test
    pub bpm: Arc<dyn BpmDevice>,
    /// Gate source modulating the RF, needed by the fill pattern sweeps
    pub gate: Option<Arc<dyn GateSource>>,
    /// Attenuator between splitter and BPM, needed by the position sweeps
    pub attenuator: Option<Arc<dyn Attenuator>>,
}

impl TestBench {
    /// Bench with only an RF source and a BPM
    pub fn new(rf: Arc<dyn RfSource>, bpm: Arc<dyn BpmDevice>) -> Self {
        Self {
            rf,
            bpm,
            gate: None,
            attenuator: None,
        }
    }

    /// Add a gate source
    pub fn with_gate(mut self, gate: Arc<dyn GateSource>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Add an attenuator
    pub fn with_attenuator(mut self, attenuator: Arc<dyn Attenuator>) -> Self {
        self.attenuator = Some(attenuator);
        self
    }

    /// Gate source, or a configuration error naming the sweep that needs it
    pub fn gate(&self, sweep: &str) -> Result<&dyn GateSource> {
        match &self.gate {
            Some(gate) => Ok(gate.as_ref()),
            None => Err(HarnessError::Configuration(format!(
                "{} requires a gate source",
                sweep
            ))
            .into()),
        }
    }

    /// Attenuator, or a configuration error naming the sweep that needs it
    pub fn attenuator(&self, sweep: &str) -> Result<&dyn Attenuator> {
        match &self.attenuator {
            Some(attenuator) => Ok(attenuator.as_ref()),
            None => Err(HarnessError::Configuration(format!(
                "{} requires a programmable attenuator",
                sweep
            ))
            .into()),
        }
    }

    /// Limit the RF output to what the BPM tolerates
    pub async fn protect_bpm(&self) -> Result<f64> {
        let tolerance = self.bpm.input_tolerance();
        let limit = self.rf.set_output_power_limit(tolerance).await?;
        info!(limit = %limit, "RF output limited to BPM input tolerance");
        Ok(limit.value)
    }
}

/// Wait for a set-point change to settle
pub(crate) async fn settle(settling: Duration) {
    if !settling.is_zero() {
        tokio::time::sleep(settling).await;
    }
}

/// Settling time in seconds as a `Duration`
///
/// # Errors
/// Returns `HarnessError::OutOfRange` for negative or non-finite values.
pub fn settling_duration(seconds: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| HarnessError::OutOfRange {
        quantity: "Settling time",
        value: seconds,
        allowed: "finite and at least 0 s",
    })
}

/// Parameter line for the settling time, e.g. `Settling time: 0.5s`
pub(crate) fn settling_parameter(settling: Duration) -> String {
    format!("Settling time: {}s", settling.as_secs_f64())
}

/// One configured sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SweepDefinition {
    /// RF power ramp, see [`beam_power_dependence`]
    PowerDependence(PowerDependenceParams),
    /// Duty cycle ramp at fixed power, see [`fixed_amplitude_fill_pattern`]
    FixedAmplitudeFillPattern(FillPatternParams),
    /// Duty cycle ramp with compensated power, see [`scaled_amplitude_fill_pattern`]
    ScaledAmplitudeFillPattern(ScaledFillPatternParams),
    /// Every attenuation combination, see [`attenuation_permutation`]
    AttenuationPermutation(PermutationParams),
    /// Raster across the aperture, see [`equidistant_grid_raster`]
    GridRaster(GridRasterParams),
}

impl SweepDefinition {
    /// Section title of the sweep
    pub fn name(&self) -> &'static str {
        match self {
            Self::PowerDependence(_) => power_dependence::NAME,
            Self::FixedAmplitudeFillPattern(_) => fill_pattern::FIXED_NAME,
            Self::ScaledAmplitudeFillPattern(_) => fill_pattern::SCALED_NAME,
            Self::AttenuationPermutation(_) => beam_position::PERMUTATION_NAME,
            Self::GridRaster(p) if p.quantised => beam_position::GRID_NAME,
            Self::GridRaster(_) => beam_position::LINEAR_GRID_NAME,
        }
    }

    /// Settling time override in seconds
    pub fn settling_time_s(&self) -> Option<f64> {
        match self {
            Self::PowerDependence(p) => p.settling_time_s,
            Self::FixedAmplitudeFillPattern(p) => p.settling_time_s,
            Self::ScaledAmplitudeFillPattern(p) => p.settling_time_s,
            Self::AttenuationPermutation(p) => p.settling_time_s,
            Self::GridRaster(p) => p.settling_time_s,
        }
    }

    /// Whether the sweep drives a gate source
    pub fn needs_gate(&self) -> bool {
        matches!(
            self,
            Self::FixedAmplitudeFillPattern(_) | Self::ScaledAmplitudeFillPattern(_)
        )
    }

    /// Whether the sweep drives an attenuator
    pub fn needs_attenuator(&self) -> bool {
        matches!(self, Self::AttenuationPermutation(_) | Self::GridRaster(_))
    }

    /// Run the sweep, returning its report section
    pub async fn run(&self, bench: &TestBench, settling: Duration) -> Result<ReportSection> {
        let section = match self {
            Self::PowerDependence(p) => {
                beam_power_dependence(bench.rf.as_ref(), bench.bpm.as_ref(), p, settling)
                    .await?
                    .1
            }
            Self::FixedAmplitudeFillPattern(p) => {
                let gate = bench.gate(self.name())?;
                fixed_amplitude_fill_pattern(bench.rf.as_ref(), bench.bpm.as_ref(), gate, p, settling)
                    .await?
                    .1
            }
            Self::ScaledAmplitudeFillPattern(p) => {
                let gate = bench.gate(self.name())?;
                scaled_amplitude_fill_pattern(bench.rf.as_ref(), bench.bpm.as_ref(), gate, p, settling)
                    .await?
                    .1
            }
            Self::AttenuationPermutation(p) => {
                let attenuator = bench.attenuator(self.name())?;
                attenuation_permutation(bench.rf.as_ref(), bench.bpm.as_ref(), attenuator, p, settling)
                    .await?
                    .1
            }
            Self::GridRaster(p) => {
                let attenuator = bench.attenuator(self.name())?;
                equidistant_grid_raster(bench.rf.as_ref(), bench.bpm.as_ref(), attenuator, p, settling)
                    .await?
                    .1
            }
        };
        Ok(section)
    }
}

/// Run sweeps in order, adding one section per sweep to `report`
///
/// A failing sweep is recorded as a failed section and the remaining sweeps
/// still run.
pub async fn run_sweeps(
    bench: &TestBench,
    sweeps: &[SweepDefinition],
    default_settling: Duration,
    report: &mut TestReport,
) {
    for sweep in sweeps {
        let outcome = match sweep.settling_time_s().map(settling_duration).transpose() {
            Ok(settling) => sweep.run(bench, settling.unwrap_or(default_settling)).await,
            Err(e) => Err(e.into()),
        };
        let section = match outcome {
            Ok(section) => section,
            Err(e) => {
                error!(sweep = sweep.name(), error = %format!("{:#}", e), "Sweep failed");
                ReportSection::new(sweep.name(), "")
                    .with_error(format!("{:#}", e))
                    .mark_completed(Utc::now())
            }
        };
        report.add_section(section);
    }
    info!(
        passed = report.passed_count(),
        failed = report.failed_count(),
        "All sweeps finished"
    );
}
