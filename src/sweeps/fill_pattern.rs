//! Fill pattern sweeps
//!
//! The RF signal is gated by a pulse train whose duty cycle stands in for the
//! fraction of filled buckets. Both sweeps step the duty cycle from 10 % to
//! 100 %:
//!
//! - fixed amplitude keeps the generator power constant, so the average power
//!   at the BPM falls with the duty cycle;
//! - scaled amplitude raises the generator power by `|20 log10(duty)|` to hold
//!   the peak amplitude the BPM sees.
//!
//! RF output and modulation are both switched off before returning.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{settle, settling_parameter, DEFAULT_RF_FREQUENCY_MHZ};
use crate::error::HarnessError;
use crate::hardware::{BpmDevice, GateSource, RfSource};
use crate::report::{PlotSpec, ReportSection, ResultTable};
use crate::units::linspace;

pub(crate) const FIXED_NAME: &str = "Fixed amplitude fill pattern test";
pub(crate) const SCALED_NAME: &str = "Scaled amplitude fill pattern test";

const FIXED_INTRO: &str = "Tests how the BPM readings depend on the bunch pattern when the \
charge in the bunches varies. The RF signal has a fixed frequency and power and is mixed with a \
gating signal. The duty cycle of the gate is stepped and the BPM parameters are recorded after \
each step. With a constant RF amplitude the power at the BPM drops as the duty cycle falls.";

const SCALED_INTRO: &str = "Tests how the BPM readings depend on the bunch pattern when the \
bunch charge is held constant. The RF signal is mixed with a gating signal whose duty cycle is \
stepped, and the RF output power is raised by the magnitude of 20 log10 of the duty cycle so the \
peak amplitude reaching the BPM stays at the desired power.";

const DEFAULT_PULSE_PERIOD_US: f64 = 1.87319;

/// Parameters of [`fixed_amplitude_fill_pattern`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillPatternParams {
    /// RF frequency in MHz
    pub frequency: f64,
    /// RF output power in dBm
    pub power: f64,
    /// Number of duty cycle steps between 0.1 and 1
    pub samples: usize,
    /// Gate period in microseconds
    pub pulse_period: f64,
    /// Settling time override in seconds
    pub settling_time_s: Option<f64>,
}

impl Default for FillPatternParams {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_RF_FREQUENCY_MHZ,
            power: 0.0,
            samples: 10,
            pulse_period: DEFAULT_PULSE_PERIOD_US,
            settling_time_s: None,
        }
    }
}

/// Parameters of [`scaled_amplitude_fill_pattern`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaledFillPatternParams {
    /// RF frequency in MHz
    pub frequency: f64,
    /// Peak power at full duty cycle in dBm
    pub desired_power: f64,
    /// Number of duty cycle steps between 0.1 and 1
    pub samples: usize,
    /// Gate period in microseconds
    pub pulse_period: f64,
    /// Settling time override in seconds
    pub settling_time_s: Option<f64>,
}

impl Default for ScaledFillPatternParams {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_RF_FREQUENCY_MHZ,
            desired_power: 0.0,
            samples: 10,
            pulse_period: DEFAULT_PULSE_PERIOD_US,
            settling_time_s: None,
        }
    }
}

/// Readings per duty cycle step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FillPatternResult {
    /// Duty cycle read back from the gate source
    pub dutycycle: Vec<f64>,
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

/// Power that restores the peak amplitude lost to gating
pub fn scaled_power(desired_power: f64, dutycycle: f64) -> Result<f64> {
    if dutycycle <= 0.0 {
        bail!(HarnessError::OutOfRange {
            quantity: "Duty cycle",
            value: dutycycle,
            allowed: "greater than 0 when scaling power",
        });
    }
    Ok(desired_power + (20.0 * dutycycle.log10()).abs())
}

/// Step the gate duty cycle with the RF amplitude held constant.
pub async fn fixed_amplitude_fill_pattern(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    gate: &dyn GateSource,
    params: &FillPatternParams,
    settling: Duration,
) -> Result<(FillPatternResult, ReportSection)> {
    info!("Starting test \"{}\"", FIXED_NAME);
    let section = ReportSection::new(FIXED_NAME, FIXED_INTRO);
    let devices = vec![
        rf.device_id().await?,
        gate.device_id().await?,
        bpm.device_id().await?,
    ];

    let duties = linspace(0.1, 1.0, params.samples);
    let outcome = async {
        let setup =
            start_modulated(rf, gate, params.frequency, params.power, params.pulse_period, &duties)
                .await?;
        settle(settling).await;
        let result = duty_ramp(rf, bpm, gate, &duties, None, settling).await?;
        Ok::<_, anyhow::Error>((setup, result))
    }
    .await;
    let ((frequency, power, period), result) = stop_modulated(rf, gate, outcome).await?;

    let table = ResultTable::new("Changing gate duty cycle, with fixed RF amplitude")
        .with_column("Duty Cycle", "0-1", result.dutycycle.clone())
        .with_column("Input Power", "dBm", result.input_power.clone())
        .with_column("BPM Current", "mA", result.beam_current.clone())
        .with_column("X Position", "mm", result.x_position.clone())
        .with_column("Y Position", "mm", result.y_position.clone())
        .with_column("ADC Sum", "Counts", result.adc_sum.clone());

    let section = section
        .with_devices(devices)
        .with_parameter(format!("Frequency: {}", frequency))
        .with_parameter(format!("Output Power: {}", power))
        .with_parameter(format!("Pulse Period: {}", period))
        .with_parameter(format!("Samples: {}", params.samples))
        .with_parameter(settling_parameter(settling))
        .with_table(table);
    let section = with_duty_plots(section, "DC").mark_completed(Utc::now());

    Ok((result, section))
}

/// Step the gate duty cycle, scaling the RF power to keep the peak amplitude.
pub async fn scaled_amplitude_fill_pattern(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    gate: &dyn GateSource,
    params: &ScaledFillPatternParams,
    settling: Duration,
) -> Result<(FillPatternResult, ReportSection)> {
    info!("Starting test \"{}\"", SCALED_NAME);
    let section = ReportSection::new(SCALED_NAME, SCALED_INTRO);
    let devices = vec![
        rf.device_id().await?,
        gate.device_id().await?,
        bpm.device_id().await?,
    ];

    let duties = linspace(0.1, 1.0, params.samples);
    let outcome = async {
        let setup = start_modulated(
            rf,
            gate,
            params.frequency,
            params.desired_power,
            params.pulse_period,
            &duties,
        )
        .await?;
        settle(settling).await;
        let result =
            duty_ramp(rf, bpm, gate, &duties, Some(params.desired_power), settling).await?;
        Ok::<_, anyhow::Error>((setup, result))
    }
    .await;
    let ((frequency, _, period), result) = stop_modulated(rf, gate, outcome).await?;

    let table = ResultTable::new("Changing gate duty cycle, with scaled RF amplitude")
        .with_column("Duty Cycle", "0-1", result.dutycycle.clone())
        .with_column("Output Power", "dBm", result.output_power.clone())
        .with_column("Input Power", "dBm", result.input_power.clone())
        .with_column("BPM Current", "mA", result.beam_current.clone())
        .with_column("X Position", "mm", result.x_position.clone())
        .with_column("Y Position", "mm", result.y_position.clone())
        .with_column("ADC Sum", "Counts", result.adc_sum.clone());

    let section = section
        .with_devices(devices)
        .with_parameter(format!("Frequency: {}", frequency))
        .with_parameter(format!("Desired Power: {}dBm", params.desired_power))
        .with_parameter(format!("Pulse Period: {}", period))
        .with_parameter(format!("Samples: {}", params.samples))
        .with_parameter(settling_parameter(settling))
        .with_table(table)
        .with_plot(PlotSpec::new(
            "Duty Cycle",
            "Output Power",
            "Gating signal duty cycle (0-1)",
            "RF Source Power Output (dBm)",
            "scaled_DC_vs_output_power",
        ));
    let section = with_duty_plots(section, "scaled_DC").mark_completed(Utc::now());

    Ok((result, section))
}

/// Configure generator and gate, then enable both.
///
/// Returns the frequency, power and period as read back for the report.
async fn start_modulated(
    rf: &dyn RfSource,
    gate: &dyn GateSource,
    frequency: f64,
    power: f64,
    pulse_period: f64,
    duties: &[f64],
) -> Result<(String, String, String)> {
    let frequency = rf
        .set_frequency(frequency)
        .await
        .context("Failed to set RF frequency")?;
    let power = rf
        .set_output_power(power)
        .await
        .context("Failed to set RF power")?;
    let period = gate
        .set_pulse_period(pulse_period)
        .await
        .context("Failed to set gate period")?;
    if let Some(first) = duties.first() {
        gate.set_pulse_dutycycle(*first).await?;
    }
    rf.turn_on_rf().await?;
    gate.turn_on_modulation().await?;
    Ok((frequency.text, power.text, period.text))
}

/// Switch RF and modulation off, then surface the sweep outcome.
///
/// Runs whether setup or the ramp failed, so RF is never left on.
async fn stop_modulated<T>(
    rf: &dyn RfSource,
    gate: &dyn GateSource,
    outcome: Result<T>,
) -> Result<T> {
    let rf_off = rf.turn_off_rf().await;
    let gate_off = gate.turn_off_modulation().await;
    let result = outcome?;
    rf_off?;
    gate_off?;
    Ok(result)
}

async fn duty_ramp(
    rf: &dyn RfSource,
    bpm: &dyn BpmDevice,
    gate: &dyn GateSource,
    duties: &[f64],
    desired_power: Option<f64>,
    settling: Duration,
) -> Result<FillPatternResult> {
    let mut result = FillPatternResult::default();
    for &duty in duties {
        let dutycycle = gate.set_pulse_dutycycle(duty).await?;
        if let Some(desired) = desired_power {
            rf.set_output_power(scaled_power(desired, dutycycle)?).await?;
        }
        settle(settling).await;
        result.dutycycle.push(dutycycle);
        result.output_power.push(rf.output_power().await?.value);
        result.input_power.push(bpm.input_power().await?);
        result.beam_current.push(bpm.beam_current().await?);
        result.x_position.push(bpm.x_position().await?);
        result.y_position.push(bpm.y_position().await?);
        result.adc_sum.push(bpm.adc_sum().await?);
        debug!(dutycycle, "duty cycle step recorded");
    }
    Ok(result)
}

fn with_duty_plots(section: ReportSection, prefix: &str) -> ReportSection {
    let x_label = "Gating signal duty cycle (0-1)";
    section
        .with_plot(PlotSpec::new(
            "Duty Cycle",
            "Input Power",
            x_label,
            "Power input at BPM (dBm)",
            &format!("{}_vs_power", prefix),
        ))
        .with_plot(PlotSpec::new(
            "Duty Cycle",
            "BPM Current",
            x_label,
            "Beam Current at BPM (mA)",
            &format!("{}_vs_current", prefix),
        ))
        .with_plot(PlotSpec::new(
            "Duty Cycle",
            "X Position",
            x_label,
            "Horizontal Beam Position (mm)",
            &format!("{}_vs_X", prefix),
        ))
        .with_plot(PlotSpec::new(
            "Duty Cycle",
            "Y Position",
            x_label,
            "Vertical Beam Position (mm)",
            &format!("{}_vs_Y", prefix),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{SimulatedBpm, SimulatedGateSource, SimulatedRfSource};
    use std::sync::Arc;

    struct Chain {
        rf: Arc<SimulatedRfSource>,
        gate: Arc<SimulatedGateSource>,
        bpm: SimulatedBpm,
    }

    fn chain() -> Chain {
        let rf = Arc::new(SimulatedRfSource::new());
        let gate = Arc::new(SimulatedGateSource::new());
        let bpm = SimulatedBpm::new(rf.clone(), Some(gate.clone()));
        Chain { rf, gate, bpm }
    }

    #[test]
    fn test_scaled_power() {
        assert!((scaled_power(-60.0, 0.1).unwrap() - -40.0).abs() < 1e-9);
        assert!((scaled_power(-60.0, 1.0).unwrap() - -60.0).abs() < 1e-9);
        assert!(scaled_power(-60.0, 0.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_amplitude_duty_ramp() {
        let c = chain();
        let params = FillPatternParams {
            power: -50.0,
            samples: 3,
            pulse_period: 3.0,
            ..Default::default()
        };

        let (result, section) = fixed_amplitude_fill_pattern(
            c.rf.as_ref(),
            &c.bpm,
            c.gate.as_ref(),
            &params,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(result.dutycycle.len(), 3);
        assert!((result.dutycycle[1] - 0.55).abs() < 1e-12);
        // duty * rf power less the simulated path loss
        assert!((result.input_power[0] - (0.1 * -50.0 - 12.0)).abs() < 1e-9);
        assert!((result.input_power[2] - -62.0).abs() < 1e-9);
        assert!(result.output_power.iter().all(|p| *p == -50.0));

        assert!(!c.rf.output_state().await.unwrap());
        assert!(!c.gate.modulation_state().await.unwrap());

        assert!(section.parameters.contains(&"Pulse Period: 3uS".to_string()));
        assert!(section.parameters.contains(&"Output Power: -50dBm".to_string()));
        assert_eq!(section.tables[0].headings.len(), 6);
        assert_eq!(section.plots.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scaled_amplitude_raises_power() {
        let c = chain();
        let params = ScaledFillPatternParams {
            desired_power: -60.0,
            samples: 2,
            ..Default::default()
        };

        let (result, section) = scaled_amplitude_fill_pattern(
            c.rf.as_ref(),
            &c.bpm,
            c.gate.as_ref(),
            &params,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert!((result.output_power[0] - -40.0).abs() < 1e-9);
        assert!((result.output_power[1] - -60.0).abs() < 1e-9);
        assert_eq!(
            section.tables[0].caption,
            "Changing gate duty cycle, with scaled RF amplitude"
        );
        assert!(!c.rf.output_state().await.unwrap());
    }

    struct DisconnectedBpm;

    #[async_trait::async_trait]
    impl BpmDevice for DisconnectedBpm {
        async fn x_position(&self) -> Result<f64> {
            bail!("BPM disconnected")
        }
        async fn y_position(&self) -> Result<f64> {
            bail!("BPM disconnected")
        }
        async fn beam_current(&self) -> Result<f64> {
            bail!("BPM disconnected")
        }
        async fn input_power(&self) -> Result<f64> {
            bail!("BPM disconnected")
        }
        async fn raw_buttons(&self) -> Result<crate::position::ButtonSignals> {
            bail!("BPM disconnected")
        }
        async fn normalised_buttons(&self) -> Result<crate::position::ButtonSignals> {
            bail!("BPM disconnected")
        }
        async fn adc_sum(&self) -> Result<f64> {
            bail!("BPM disconnected")
        }
        async fn device_id(&self) -> Result<String> {
            Ok("Disconnected BPM".to_string())
        }
        fn input_tolerance(&self) -> f64 {
            -40.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_turned_off_on_error() {
        let c = chain();
        let params = FillPatternParams {
            power: -50.0,
            samples: 3,
            ..Default::default()
        };

        let err = fixed_amplitude_fill_pattern(
            c.rf.as_ref(),
            &DisconnectedBpm,
            c.gate.as_ref(),
            &params,
            Duration::ZERO,
        )
        .await
        .err()
        .unwrap();

        assert!(err.to_string().contains("disconnected"));
        assert!(!c.rf.output_state().await.unwrap());
        assert!(!c.gate.modulation_state().await.unwrap());
    }

    /// Gate whose modulation switch fails after RF is already on
    struct StuckGate(SimulatedGateSource);

    #[async_trait::async_trait]
    impl GateSource for StuckGate {
        async fn device_id(&self) -> Result<String> {
            self.0.device_id().await
        }
        async fn turn_on_modulation(&self) -> Result<bool> {
            bail!("gate link dropped")
        }
        async fn turn_off_modulation(&self) -> Result<bool> {
            self.0.turn_off_modulation().await
        }
        async fn modulation_state(&self) -> Result<bool> {
            self.0.modulation_state().await
        }
        async fn set_pulse_period(&self, us: f64) -> Result<crate::units::Quantity> {
            self.0.set_pulse_period(us).await
        }
        async fn pulse_period(&self) -> Result<crate::units::Quantity> {
            self.0.pulse_period().await
        }
        async fn set_pulse_dutycycle(&self, dutycycle: f64) -> Result<f64> {
            self.0.set_pulse_dutycycle(dutycycle).await
        }
        async fn pulse_dutycycle(&self) -> Result<f64> {
            self.0.pulse_dutycycle().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rf_turned_off_when_modulation_fails() {
        let rf = Arc::new(SimulatedRfSource::new());
        let gate = StuckGate(SimulatedGateSource::new());
        let bpm = SimulatedBpm::new(rf.clone(), None);

        let err = fixed_amplitude_fill_pattern(
            rf.as_ref(),
            &bpm,
            &gate,
            &FillPatternParams::default(),
            Duration::ZERO,
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("gate link dropped"));
        assert!(!rf.output_state().await.unwrap());

        let err = scaled_amplitude_fill_pattern(
            rf.as_ref(),
            &bpm,
            &gate,
            &ScaledFillPatternParams::default(),
            Duration::ZERO,
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("gate link dropped"));
        assert!(!rf.output_state().await.unwrap());
    }
}
