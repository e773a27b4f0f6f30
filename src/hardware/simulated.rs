//! Simulated devices
//!
//! Pure in-memory stand-ins for each capability, so sweeps can be developed
//! and tested without lab access. State lives behind `tokio::sync::RwLock`
//! and every setter applies the same range checks as the real drivers.
//!
//! # Available Simulations
//!
//! - `SimulatedRfSource` - signal generator with output power limit
//! - `SimulatedGateSource` - pulse modulation source
//! - `SimulatedAttenuator` - four channel attenuator
//! - `SimulatedBpm` - BPM whose readings follow the simulated RF chain

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::hardware::capabilities::{
    check_attenuation, check_dutycycle, check_non_negative, Attenuator, BpmDevice, Channel,
    GateSource, RfSource,
};
use crate::position::ButtonSignals;
use crate::units::Quantity;

/// Default output power limit of the simulated generator (dBm)
pub const DEFAULT_RF_LIMIT_DBM: f64 = -40.0;

// =============================================================================
// SimulatedRfSource
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RfState {
    power: f64,
    frequency: f64,
    output: bool,
    limit: f64,
}

/// Simulated RF signal generator
///
/// Starts at 0 dBm, 0 MHz with the output off. Power requests above the
/// limit are capped, as the real generator is.
pub struct SimulatedRfSource {
    state: RwLock<RfState>,
}

impl SimulatedRfSource {
    /// Create with the default -40 dBm limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_RF_LIMIT_DBM)
    }

    /// Create with a custom output power limit in dBm
    pub fn with_limit(limit: f64) -> Self {
        Self {
            state: RwLock::new(RfState {
                power: 0.0,
                frequency: 0.0,
                output: false,
                limit,
            }),
        }
    }
}

impl Default for SimulatedRfSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RfSource for SimulatedRfSource {
    async fn device_id(&self) -> Result<String> {
        Ok("Simulated RF Device".to_string())
    }

    async fn set_frequency(&self, mhz: f64) -> Result<Quantity> {
        check_non_negative("Frequency", mhz)?;
        self.state.write().await.frequency = mhz;
        self.frequency().await
    }

    async fn frequency(&self) -> Result<Quantity> {
        Ok(Quantity::new(self.state.read().await.frequency, "MHz"))
    }

    async fn set_output_power(&self, dbm: f64) -> Result<Quantity> {
        {
            let mut state = self.state.write().await;
            state.power = if dbm > state.limit {
                warn!(
                    requested = dbm,
                    limit = state.limit,
                    "Power limit has been reached, output will be capped"
                );
                state.limit
            } else {
                dbm
            };
        }
        self.output_power().await
    }

    async fn output_power(&self) -> Result<Quantity> {
        Ok(Quantity::new(self.state.read().await.power, "dBm"))
    }

    async fn turn_on_rf(&self) -> Result<bool> {
        self.state.write().await.output = true;
        self.output_state().await
    }

    async fn turn_off_rf(&self) -> Result<bool> {
        self.state.write().await.output = false;
        self.output_state().await
    }

    async fn output_state(&self) -> Result<bool> {
        Ok(self.state.read().await.output)
    }

    async fn set_output_power_limit(&self, dbm: f64) -> Result<Quantity> {
        self.state.write().await.limit = dbm;
        self.output_power_limit().await
    }

    async fn output_power_limit(&self) -> Result<Quantity> {
        Ok(Quantity::new(self.state.read().await.limit, "dBm"))
    }
}

// =============================================================================
// SimulatedGateSource
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct GateState {
    period: f64,
    dutycycle: f64,
    enabled: bool,
}

/// Simulated pulse source: 3 us period, 0 duty cycle, modulation off.
pub struct SimulatedGateSource {
    state: RwLock<GateState>,
}

impl SimulatedGateSource {
    /// Create a gate source in its power-on state
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GateState {
                period: 3.0,
                dutycycle: 0.0,
                enabled: false,
            }),
        }
    }
}

impl Default for SimulatedGateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GateSource for SimulatedGateSource {
    async fn device_id(&self) -> Result<String> {
        Ok("Simulated GateSource".to_string())
    }

    async fn turn_on_modulation(&self) -> Result<bool> {
        self.state.write().await.enabled = true;
        self.modulation_state().await
    }

    async fn turn_off_modulation(&self) -> Result<bool> {
        self.state.write().await.enabled = false;
        self.modulation_state().await
    }

    async fn modulation_state(&self) -> Result<bool> {
        Ok(self.state.read().await.enabled)
    }

    async fn set_pulse_period(&self, us: f64) -> Result<Quantity> {
        check_non_negative("Pulse period", us)?;
        self.state.write().await.period = us;
        self.pulse_period().await
    }

    async fn pulse_period(&self) -> Result<Quantity> {
        Ok(Quantity::new(self.state.read().await.period, "uS"))
    }

    async fn set_pulse_dutycycle(&self, dutycycle: f64) -> Result<f64> {
        check_dutycycle(dutycycle)?;
        self.state.write().await.dutycycle = dutycycle;
        self.pulse_dutycycle().await
    }

    async fn pulse_dutycycle(&self) -> Result<f64> {
        Ok(self.state.read().await.dutycycle)
    }
}

// =============================================================================
// SimulatedAttenuator
// =============================================================================

/// Simulated four channel attenuator, all channels at 0 dB.
#[derive(Default)]
pub struct SimulatedAttenuator {
    channels: RwLock<[f64; 4]>,
}

impl SimulatedAttenuator {
    /// Create with every channel at 0 dB
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Attenuator for SimulatedAttenuator {
    async fn device_id(&self) -> Result<String> {
        Ok("Simulated programmable attenuator device".to_string())
    }

    async fn set_global_attenuation(&self, db: f64) -> Result<[f64; 4]> {
        check_attenuation(db)?;
        *self.channels.write().await = [db; 4];
        self.global_attenuation().await
    }

    async fn global_attenuation(&self) -> Result<[f64; 4]> {
        Ok(*self.channels.read().await)
    }

    async fn set_channel_attenuation(&self, channel: Channel, db: f64) -> Result<f64> {
        check_attenuation(db)?;
        self.channels.write().await[channel.index()] = db;
        self.channel_attenuation(channel).await
    }

    async fn channel_attenuation(&self, channel: Channel) -> Result<f64> {
        Ok(self.channels.read().await[channel.index()])
    }
}

// =============================================================================
// SimulatedBpm
// =============================================================================

/// Cable and splitter loss between generator and BPM input (dB)
const SIMULATED_PATH_LOSS_DB: f64 = 12.0;

/// Simulated BPM fed by a simulated RF chain
///
/// Input power follows the RF source output minus a fixed path loss. When a
/// gate source is attached and modulating, the generator power is scaled by
/// the duty cycle first. The beam is always centred.
pub struct SimulatedBpm {
    rf: Arc<dyn RfSource>,
    gate: Option<Arc<dyn GateSource>>,
}

impl SimulatedBpm {
    /// Create a BPM that follows `rf`, and `gate` if one is attached
    pub fn new(rf: Arc<dyn RfSource>, gate: Option<Arc<dyn GateSource>>) -> Self {
        Self { rf, gate }
    }
}

#[async_trait]
impl BpmDevice for SimulatedBpm {
    async fn x_position(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn y_position(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn beam_current(&self) -> Result<f64> {
        let power = self.input_power().await?;
        Ok(1000.0 * 1.1193f64.powf(power))
    }

    async fn input_power(&self) -> Result<f64> {
        let rf_power = self.rf.output_power().await?.value;
        let mut dutycycle = None;
        if let Some(gate) = &self.gate {
            if gate.modulation_state().await? {
                dutycycle = Some(gate.pulse_dutycycle().await?);
            }
        }
        let power = match dutycycle {
            Some(duty) => duty * rf_power - SIMULATED_PATH_LOSS_DB,
            None => rf_power - SIMULATED_PATH_LOSS_DB,
        };
        debug!(rf_power, input_power = power, "simulated BPM input");
        Ok(power)
    }

    async fn raw_buttons(&self) -> Result<ButtonSignals> {
        let current = self.beam_current().await?;
        Ok(ButtonSignals::uniform(current * 100.0))
    }

    async fn normalised_buttons(&self) -> Result<ButtonSignals> {
        Ok(ButtonSignals::uniform(1.0))
    }

    async fn adc_sum(&self) -> Result<f64> {
        Ok(self.raw_buttons().await?.sum())
    }

    async fn device_id(&self) -> Result<String> {
        Ok("Simulated BPM Device".to_string())
    }

    fn input_tolerance(&self) -> f64 {
        -40.0
    }
}
