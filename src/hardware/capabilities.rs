//! Capability traits for the four device families a BPM test drives.
//!
//! Each family has a simulated implementation and one or more drivers that
//! speak to real hardware. Sweeps only ever see these traits, so the same
//! sweep runs against a bench of instruments or against pure in-memory state.
//!
//! Setters return the value read back from the device after the change,
//! which is what the sweeps record.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, HarnessError};
use crate::position::ButtonSignals;
use crate::units::Quantity;

/// Highest attenuation the programmable attenuators accept (dB).
pub const MAX_ATTENUATION_DB: f64 = 95.0;

/// Beam position monitor readout.
#[async_trait]
pub trait BpmDevice: Send + Sync {
    /// Horizontal beam position in mm
    async fn x_position(&self) -> Result<f64>;

    /// Vertical beam position in mm
    async fn y_position(&self) -> Result<f64>;

    /// Beam current in mA
    async fn beam_current(&self) -> Result<f64>;

    /// Power arriving at the BPM input in dBm
    async fn input_power(&self) -> Result<f64>;

    /// Raw button levels
    async fn raw_buttons(&self) -> Result<ButtonSignals>;

    /// Button levels divided by their mean
    async fn normalised_buttons(&self) -> Result<ButtonSignals>;

    /// Sum of the ADC counts over the four buttons
    async fn adc_sum(&self) -> Result<f64>;

    /// Identification string used in reports
    async fn device_id(&self) -> Result<String>;

    /// Maximum continuous input power the electronics withstand, in dBm
    fn input_tolerance(&self) -> f64;
}

/// RF signal generator.
#[async_trait]
pub trait RfSource: Send + Sync {
    /// Identification string used in reports
    async fn device_id(&self) -> Result<String>;

    /// Set output frequency in MHz. Negative frequencies are rejected.
    async fn set_frequency(&self, mhz: f64) -> Result<Quantity>;

    /// Current output frequency
    async fn frequency(&self) -> Result<Quantity>;

    /// Set output power in dBm.
    ///
    /// Requests above the output power limit are capped at the limit.
    async fn set_output_power(&self, dbm: f64) -> Result<Quantity>;

    /// Current output power
    async fn output_power(&self) -> Result<Quantity>;

    /// Enable the RF output, returning the new output state
    async fn turn_on_rf(&self) -> Result<bool>;

    /// Disable the RF output, returning the new output state
    async fn turn_off_rf(&self) -> Result<bool>;

    /// Whether the RF output is enabled
    async fn output_state(&self) -> Result<bool>;

    /// Set the maximum output power in dBm
    async fn set_output_power_limit(&self, dbm: f64) -> Result<Quantity>;

    /// Current maximum output power
    async fn output_power_limit(&self) -> Result<Quantity>;
}

/// Pulse source gating the RF output.
#[async_trait]
pub trait GateSource: Send + Sync {
    /// Identification string used in reports
    async fn device_id(&self) -> Result<String>;

    /// Enable pulse modulation, returning the new state
    async fn turn_on_modulation(&self) -> Result<bool>;

    /// Disable pulse modulation, returning the new state
    async fn turn_off_modulation(&self) -> Result<bool>;

    /// Whether pulse modulation is enabled
    async fn modulation_state(&self) -> Result<bool>;

    /// Set the pulse period in microseconds
    async fn set_pulse_period(&self, us: f64) -> Result<Quantity>;

    /// Current pulse period
    async fn pulse_period(&self) -> Result<Quantity>;

    /// Set the fraction of the period the gate is open (0 to 1)
    async fn set_pulse_dutycycle(&self, dutycycle: f64) -> Result<f64>;

    /// Current duty cycle
    async fn pulse_dutycycle(&self) -> Result<f64>;
}

/// Four channel programmable attenuator.
#[async_trait]
pub trait Attenuator: Send + Sync {
    /// Identification string used in reports
    async fn device_id(&self) -> Result<String>;

    /// Set every channel to the same attenuation in dB
    async fn set_global_attenuation(&self, db: f64) -> Result<[f64; 4]>;

    /// Attenuation of all channels in A, B, C, D order
    async fn global_attenuation(&self) -> Result<[f64; 4]>;

    /// Set one channel's attenuation in dB
    async fn set_channel_attenuation(&self, channel: Channel, db: f64) -> Result<f64>;

    /// Attenuation of one channel
    async fn channel_attenuation(&self, channel: Channel) -> Result<f64>;
}

/// Attenuator channel, wired to the BPM button of the same letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Channel 1
    A,
    /// Channel 2
    B,
    /// Channel 3
    C,
    /// Channel 4
    D,
}

impl Channel {
    /// All channels in order.
    pub const ALL: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    /// One-based channel number used on the instrument.
    pub fn number(self) -> u8 {
        match self {
            Channel::A => 1,
            Channel::B => 2,
            Channel::C => 3,
            Channel::D => 4,
        }
    }

    /// Zero-based index into `[f64; 4]` arrays.
    pub fn index(self) -> usize {
        usize::from(self.number() - 1)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Channel::A => "A",
            Channel::B => "B",
            Channel::C => "C",
            Channel::D => "D",
        };
        f.write_str(letter)
    }
}

impl FromStr for Channel {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" | "1" => Ok(Channel::A),
            "B" | "2" => Ok(Channel::B),
            "C" | "3" => Ok(Channel::C),
            "D" | "4" => Ok(Channel::D),
            _ => Err(HarnessError::InvalidChannel(s.to_string())),
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = HarnessError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Channel::A),
            2 => Ok(Channel::B),
            3 => Ok(Channel::C),
            4 => Ok(Channel::D),
            _ => Err(HarnessError::InvalidChannel(n.to_string())),
        }
    }
}

/// Reject attenuations outside what the attenuators can set.
pub fn check_attenuation(db: f64) -> AppResult<()> {
    if !(0.0..=MAX_ATTENUATION_DB).contains(&db) {
        return Err(HarnessError::OutOfRange {
            quantity: "Attenuation",
            value: db,
            allowed: "0 to 95 dB",
        });
    }
    Ok(())
}

/// Reject duty cycles outside 0 to 1.
pub fn check_dutycycle(dutycycle: f64) -> AppResult<()> {
    if !(0.0..=1.0).contains(&dutycycle) {
        return Err(HarnessError::OutOfRange {
            quantity: "Duty cycle",
            value: dutycycle,
            allowed: "0 to 1",
        });
    }
    Ok(())
}

/// Reject negative values (frequencies and periods).
pub fn check_non_negative(quantity: &'static str, value: f64) -> AppResult<()> {
    if value < 0.0 || value.is_nan() {
        return Err(HarnessError::OutOfRange {
            quantity,
            value,
            allowed: "must not be negative",
        });
    }
    Ok(())
}
