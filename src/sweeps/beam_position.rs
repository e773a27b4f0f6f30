//! Beam position sweeps driven by the programmable attenuator.
//!
//! The RF output is split four ways, one arm per BPM button, with an
//! attenuator channel in each arm. Changing the channel attenuations moves
//! the apparent beam position. The position the BPM reports is compared with
//! the difference-over-sum prediction from the power reaching each button.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{settle, settling_parameter, DEFAULT_RF_FREQUENCY_MHZ};
use crate::hardware::{Attenuator, BpmDevice, Channel, RfSource};
use crate::position::{calc_x_pos, calc_y_pos};
use crate::report::{PlotSpec, ReportSection, ResultTable};
use crate::units::{dbm_to_mw, linspace, quarter_round};

pub(crate) const PERMUTATION_NAME: &str = "Beam position attenuation permutation test";
pub(crate) const GRID_NAME: &str = "Beam position equidistant grid raster scan test";
pub(crate) const LINEAR_GRID_NAME: &str = "Beam position linear raster scan test";

/// Loss through the four way splitter (dB)
const SPLITTER_LOSS_DB: f64 = 6.0;

const PERMUTATION_INTRO: &str = "Moves the beam position by applying every combination of \
attenuations to the four channels. A linear space is made from the minimum to the maximum \
attenuation and each permutation of four of its values is set on the attenuator. After each change \
the BPM position is recorded and compared with the position predicted from the power in each arm.";

const GRID_INTRO: &str = "Moves the beam position across the XY plane from -5 to 5 mm and \
records the beam position. A grid of button signal ratios is converted into attenuations around \
a nominal value while the RF frequency and power stay fixed. The measured positions are compared \
with the positions predicted from the power in each arm.";

/// Parameters of [`attenuation_permutation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermutationParams {
    /// RF output power in dBm
    pub rf_power: f64,
    /// RF frequency in MHz
    pub rf_frequency: f64,
    /// Highest attenuation in dB
    pub attenuator_max: f64,
    /// Lowest attenuation in dB
    pub attenuator_min: f64,
    /// Number of attenuation values between min and max
    pub attenuator_steps: usize,
    /// Settling time override in seconds
    pub settling_time_s: Option<f64>,
}

impl Default for PermutationParams {
    fn default() -> Self {
        Self {
            rf_power: -40.0,
            rf_frequency: DEFAULT_RF_FREQUENCY_MHZ,
            attenuator_max: 20.0,
            attenuator_min: 0.0,
            attenuator_steps: 3,
            settling_time_s: None,
        }
    }
}

/// Parameters of [`equidistant_grid_raster`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridRasterParams {
    /// RF output power in dBm
    pub rf_power: f64,
    /// RF frequency in MHz
    pub rf_frequency: f64,
    /// Attenuation every channel starts from in dB
    pub nominal_attenuation: f64,
    /// Grid points along X
    pub x_points: usize,
    /// Grid points along Y
    pub y_points: usize,
    /// Round attenuations to the 0.25 dB attenuator step
    pub quantised: bool,
    /// Settling time override in seconds
    pub settling_time_s: Option<f64>,
}

impl Default for GridRasterParams {
    fn default() -> Self {
        Self {
            rf_power: -40.0,
            rf_frequency: DEFAULT_RF_FREQUENCY_MHZ,
            nominal_attenuation: 10.0,
            x_points: 10,
            y_points: 10,
            quantised: true,
            settling_time_s: None,
        }
    }
}

/// Measured and predicted positions for every attenuator setting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionSweepResult {
    /// Channel attenuations applied, A to D (dB)
    pub attenuations: Vec<[f64; 4]>,
    /// X position reported by the BPM (mm)
    pub measured_x: Vec<f64>,
    /// Y position reported by the BPM (mm)
    pub measured_y: Vec<f64>,
    /// X position predicted from the arm powers (mm)
    pub predicted_x: Vec<f64>,
    /// Y position predicted from the arm powers (mm)
    pub predicted_y: Vec<f64>,
}

impl PositionSweepResult {
    fn record(&mut self, attenuations: [f64; 4], measured: (f64, f64), powers: [f64; 4]) {
        let [a, b, c, d] = powers;
        self.attenuations.push(attenuations);
        self.measured_x.push(measured.0);
        self.measured_y.push(measured.1);
        self.predicted_x.push(calc_x_pos(a, b, c, d));
        self.predicted_y.push(calc_y_pos(a, b, c, d));
    }

    fn to_table(&self, caption: &str) -> ResultTable {
        let channel = |i: usize| self.attenuations.iter().map(|att| att[i]).collect::<Vec<_>>();
        ResultTable::new(caption)
            .with_column("Attenuation A", "dB", channel(0))
            .with_column("Attenuation B", "dB", channel(1))
            .with_column("Attenuation C", "dB", channel(2))
            .with_column("Attenuation D", "dB", channel(3))
            .with_column("Measured X", "mm", self.measured_x.clone())
            .with_column("Measured Y", "mm", self.measured_y.clone())
            .with_column("Predicted X", "mm", self.predicted_x.clone())
            .with_column("Predicted Y", "mm", self.predicted_y.clone())
    }
}

/// Every 4-tuple of `values`, the last channel varying fastest
fn permutations(values: &[f64]) -> Vec<[f64; 4]> {
    let mut tuples = Vec::with_capacity(values.len().pow(4));
    for &a in values {
        for &b in values {
            for &c in values {
                for &d in values {
                    tuples.push([a, b, c, d]);
                }
            }
        }
    }
    tuples
}

/// Button signal ratios for a `x_points` by `y_points` grid, normalised to sum to 1
pub fn grid_ratios(x_points: usize, y_points: usize) -> Vec<[f64; 4]> {
    let gradient = linspace(0.0001, 2.0, x_points);
    let inverse: Vec<f64> = gradient.iter().rev().copied().collect();
    let mut ratios = Vec::with_capacity(x_points * y_points);
    for y in linspace(-1.0, 1.0, y_points) {
        for (g, inv) in gradient.iter().zip(&inverse) {
            let abcd = [g + y + 1.0, inv + y + 1.0, inv - y + 1.0, g - y + 1.0];
            let total: f64 = abcd.iter().sum();
            ratios.push(abcd.map(|v| v / total));
        }
    }
    ratios
}

async fn set_channels(attenuator: &dyn Attenuator, attenuations: [f64; 4]) -> Result<[f64; 4]> {
    let mut applied = [0.0; 4];
    for channel in Channel::ALL {
        applied[channel.index()] = attenuator
            .set_channel_attenuation(channel, attenuations[channel.index()])
            .await
            .with_context(|| format!("Failed to set attenuation on channel {}", channel))?;
    }
    Ok(applied)
}

async fn measure(bpm: &dyn BpmDevice) -> Result<(f64, f64)> {
    Ok((bpm.x_position().await?, bpm.y_position().await?))
}

async fn start_rf(rf: &dyn RfSource, power: f64, frequency: f64) -> Result<()> {
    rf.set_output_power(power)
        .await
        .context("Failed to set RF power")?;
    rf.set_frequency(frequency)
        .await
        .context("Failed to set RF frequency")?;
    rf.turn_on_rf().await?;
    Ok(())
}

fn with_position_plots(section: ReportSection, file_stem: &str) -> ReportSection {
    section
        .with_plot(PlotSpec::new(
            "Measured X",
            "Measured Y",
            "Horizontal Beam Position (mm)",
            "Vertical Beam Position (mm)",
            file_stem,
        ))
        .with_plot(PlotSpec::new(
            "Predicted X",
            "Predicted Y",
            "Horizontal Beam Position (mm)",
            "Vertical Beam Position (mm)",
            &format!("{}_predicted", file_stem),
        ))
}

/// Apply every combination of attenuations and compare measured positions
/// with the prediction.
pub async fn attenuation_permutation(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    attenuator: &dyn Attenuator,
    params: &PermutationParams,
    settling: Duration,
) -> Result<(PositionSweepResult, ReportSection)> {
    info!("Starting test \"{}\"", PERMUTATION_NAME);
    let section = ReportSection::new(PERMUTATION_NAME, PERMUTATION_INTRO);
    let devices = vec![
        rf.device_id().await?,
        bpm.device_id().await?,
        attenuator.device_id().await?,
    ];

    let values = linspace(params.attenuator_min, params.attenuator_max, params.attenuator_steps);
    let outcome = async {
        start_rf(rf, params.rf_power, params.rf_frequency).await?;
        permutation_steps(rf, bpm, attenuator, &permutations(&values), settling).await
    }
    .await;
    let off = rf.turn_off_rf().await;
    let result = outcome?;
    off?;

    let section = section
        .with_devices(devices)
        .with_parameter(format!("Fixed RF Output Power: {}dBm", params.rf_power))
        .with_parameter(format!("Fixed RF Output Frequency: {}MHz", params.rf_frequency))
        .with_parameter(format!("Maximum Attenuation: {}dB", params.attenuator_max))
        .with_parameter(format!("Minimum Attenuation: {}dB", params.attenuator_min))
        .with_parameter(format!(
            "Steps between min and max attenuations: {}",
            params.attenuator_steps
        ))
        .with_parameter(settling_parameter(settling))
        .with_table(result.to_table("Attenuation permutation positions"));
    let section = with_position_plots(section, "beam_position_attenuation_permutation")
        .mark_completed(Utc::now());

    Ok((result, section))
}

async fn permutation_steps(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    attenuator: &dyn Attenuator,
    tuples: &[[f64; 4]],
    settling: Duration,
) -> Result<PositionSweepResult> {
    let mut result = PositionSweepResult::default();
    for &attenuations in tuples {
        let applied = set_channels(attenuator, attenuations).await?;
        settle(settling).await;
        let measured = measure(bpm).await?;
        let power_out = rf.output_power().await?.value - SPLITTER_LOSS_DB;
        let powers = attenuations.map(|att| dbm_to_mw(power_out - att));
        result.record(applied, measured, powers);
        debug!(?applied, "attenuation permutation recorded");
    }
    Ok(result)
}

/// Raster the beam across an equidistant grid of button ratios.
///
/// With `quantised` set the attenuations are rounded to the 0.25 dB
/// attenuator step; otherwise they are applied unrounded.
pub async fn equidistant_grid_raster(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    attenuator: &dyn Attenuator,
    params: &GridRasterParams,
    settling: Duration,
) -> Result<(PositionSweepResult, ReportSection)> {
    let name = if params.quantised {
        GRID_NAME
    } else {
        LINEAR_GRID_NAME
    };
    info!("Starting test \"{}\"", name);
    let section = ReportSection::new(name, GRID_INTRO);
    let devices = vec![
        rf.device_id().await?,
        bpm.device_id().await?,
        attenuator.device_id().await?,
    ];

    let outcome = async {
        start_rf(rf, params.rf_power, params.rf_frequency).await?;
        grid_steps(rf, bpm, attenuator, params, settling).await
    }
    .await;
    let off = rf.turn_off_rf().await;
    let result = outcome?;
    off?;

    let file_stem = if params.quantised {
        "beam_position_equidistant_grid_raster_scan"
    } else {
        "beam_position_linear_raster_scan"
    };
    let section = section
        .with_devices(devices)
        .with_parameter(format!("Fixed RF Output Power: {}dBm", params.rf_power))
        .with_parameter(format!("Fixed RF Output Frequency: {}MHz", params.rf_frequency))
        .with_parameter(format!("Nominal Attenuation: {}dB", params.nominal_attenuation))
        .with_parameter(format!("Number of X points: {}", params.x_points))
        .with_parameter(format!("Number of Y points: {}", params.y_points))
        .with_parameter(settling_parameter(settling))
        .with_table(result.to_table("Raster scan positions"));
    let section = with_position_plots(section, file_stem).mark_completed(Utc::now());

    Ok((result, section))
}

async fn grid_steps(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    attenuator: &dyn Attenuator,
    params: &GridRasterParams,
    settling: Duration,
) -> Result<PositionSweepResult> {
    let nominal = params.nominal_attenuation;
    let mut result = PositionSweepResult::default();

    for ratios in grid_ratios(params.x_points, params.y_points) {
        attenuator
            .set_global_attenuation(nominal)
            .await
            .context("Failed to set nominal attenuation")?;
        let power_total = dbm_to_mw(rf.output_power().await?.value);
        let power_split = power_total / 4.0 * 10f64.powf(-nominal / 10.0);

        let powers = ratios.map(|ratio| ratio * 4.0 * power_split);
        let attenuations = powers.map(|power| {
            let gain = 10.0 * (power / power_split).log10();
            if params.quantised {
                nominal - quarter_round(gain)
            } else {
                nominal - gain
            }
        });

        let applied = set_channels(attenuator, attenuations).await?;
        settle(settling).await;
        let measured = measure(bpm).await?;
        result.record(applied, measured, powers);
        debug!(?applied, "raster point recorded");
    }
    Ok(result)
}
