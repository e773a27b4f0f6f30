//! Beam power dependence: ramp the RF power and watch the BPM follow.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{settle, settling_parameter, DEFAULT_RF_FREQUENCY_MHZ};
use crate::hardware::{BpmDevice, RfSource};
use crate::report::{PlotSpec, ReportSection, ResultTable};
use crate::units::linspace;

pub(crate) const NAME: &str = "Beam Power Dependence";

const INTRO: &str = "Tests the relationship between RF output power and values read from \
the BPM. An RF signal is output at a single frequency and its power is ramped linearly in dBm. \
After each step has settled the beam current, position, input power and ADC sum are read from \
the BPM.";

/// Parameters of [`beam_power_dependence`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerDependenceParams {
    /// RF frequency in MHz
    pub frequency: f64,
    /// First output power in dBm
    pub start_power: f64,
    /// Last output power in dBm
    pub end_power: f64,
    /// Number of power steps
    pub samples: usize,
    /// Settling time override in seconds
    pub settling_time_s: Option<f64>,
}

impl Default for PowerDependenceParams {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_RF_FREQUENCY_MHZ,
            start_power: -100.0,
            end_power: 0.0,
            samples: 10,
            settling_time_s: None,
        }
    }
}

/// Readings per power step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerDependenceResult {
    /// RF output power read back from the generator (dBm)
    pub output_power: Vec<f64>,
    /// Power at the BPM input (dBm)
    pub input_power: Vec<f64>,
    /// Beam current (mA)
    pub beam_current: Vec<f64>,
    /// Horizontal position (mm)
    pub x_position: Vec<f64>,
    /// Vertical position (mm)
    pub y_position: Vec<f64>,
    /// ADC sum (counts)
    pub adc_sum: Vec<f64>,
}

impl PowerDependenceResult {
    fn to_table(&self) -> ResultTable {
        ResultTable::new("Beam Power Dependence Results")
            .with_column("Output Power", "dBm", self.output_power.clone())
            .with_column("Input Power", "dBm", self.input_power.clone())
            .with_column("BPM Current", "mA", self.beam_current.clone())
            .with_column("X Position", "mm", self.x_position.clone())
            .with_column("Y Position", "mm", self.y_position.clone())
            .with_column("ADC Sum", "Counts", self.adc_sum.clone())
    }
}

/// Step the RF output from `start_power` to `end_power` and record the BPM
/// response after each step.
///
/// The RF output is switched off before returning, including on error.
pub async fn beam_power_dependence(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    params: &PowerDependenceParams,
    settling: Duration,
) -> Result<(PowerDependenceResult, ReportSection)> {
    info!("Starting test \"{}\"", NAME);
    let section = ReportSection::new(NAME, INTRO);
    let devices = vec![rf.device_id().await?, bpm.device_id().await?];

    let powers = linspace(params.start_power, params.end_power, params.samples);
    let outcome = async {
        rf.set_frequency(params.frequency)
            .await
            .context("Failed to set RF frequency")?;
        rf.set_output_power(params.start_power)
            .await
            .context("Failed to set RF start power")?;
        rf.turn_on_rf().await?;
        settle(settling).await;
        ramp(rf, bpm, &powers, settling).await
    }
    .await;
    let off = rf.turn_off_rf().await;
    let result = outcome?;
    off?;

    let section = section
        .with_devices(devices)
        .with_parameter(format!("Frequency: {}MHz", params.frequency))
        .with_parameter(format!("Starting output power: {}dBm", params.start_power))
        .with_parameter(format!("Final output power: {}dBm", params.end_power))
        .with_parameter(format!("Samples: {}", params.samples))
        .with_parameter(settling_parameter(settling))
        .with_table(result.to_table())
        .with_plot(plot("Input Power", "Power input at BPM (dBm)", "power_vs_power"))
        .with_plot(plot("BPM Current", "Beam Current at BPM (mA)", "power_vs_current"))
        .with_plot(plot("X Position", "Horizontal Beam Position (mm)", "power_vs_X"))
        .with_plot(plot("Y Position", "Vertical Beam Position (mm)", "power_vs_Y"))
        .with_plot(plot("ADC Sum", "ADC Sum (counts)", "power_vs_ADC_sum"))
        .mark_completed(Utc::now());

    Ok((result, section))
}

async fn ramp(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    powers: &[f64],
    settling: Duration,
) -> Result<PowerDependenceResult> {
    let mut result = PowerDependenceResult::default();
    for &power in powers {
        rf.set_output_power(power).await?;
        settle(settling).await;
        result.beam_current.push(bpm.beam_current().await?);
        result.x_position.push(bpm.x_position().await?);
        result.y_position.push(bpm.y_position().await?);
        result.output_power.push(rf.output_power().await?.value);
        result.input_power.push(bpm.input_power().await?);
        result.adc_sum.push(bpm.adc_sum().await?);
        debug!(power, "power step recorded");
    }
    Ok(result)
}

fn plot(y_column: &str, y_label: &str, file_stem: &str) -> PlotSpec {
    PlotSpec::new(
        "Output Power",
        y_column,
        "RF Source Power Output (dBm)",
        y_label,
        file_stem,
    )
}
