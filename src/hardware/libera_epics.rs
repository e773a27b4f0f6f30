//! Libera BPMs published through EPICS process variables.
//!
//! Two families are supported:
//!
//! - **Spark ER/XR** (`SparkErEpicsBpm`): PVs live under
//!   `{database}:signals:{daq_type}` and hold waveforms. The record is set to
//!   passive scanning and processed (`.PROC = 1`) before each read so every
//!   reading comes from a fresh acquisition. Positions are published in nm.
//! - **Electron** (`ElectronBpm`): slow-acquisition scalars under
//!   `{device}SA:*`, already in mm and mA, read directly.
//!
//! Both identify themselves by EPICS ID and the MAC address of the IOC host.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::HarnessError;
use crate::hardware::arp::lookup_mac;
use crate::hardware::capabilities::BpmDevice;
use crate::hardware::channel_access::ChannelAccess;
use crate::position::ButtonSignals;
use crate::units::mean;

const NM_PER_MM: f64 = 1_000_000.0;

/// Host part of a `host:port` string reported by channel access.
fn host_ip(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

// =============================================================================
// Spark ER/XR
// =============================================================================

/// Spark ER/XR driver
pub struct SparkErEpicsBpm {
    ca: Arc<dyn ChannelAccess>,
    epics_id: String,
    mac: String,
}

impl SparkErEpicsBpm {
    /// Open the signal record `{database}:signals:{daq_type}`
    ///
    /// # Arguments
    /// * `ca` - Channel access client
    /// * `database` - PV prefix of the unit
    /// * `daq_type` - Acquisition type, for example `sa` or `tbt`
    pub async fn connect(ca: Arc<dyn ChannelAccess>, database: &str, daq_type: &str) -> Result<Self> {
        let epics_id = format!("{}:signals:{}", database, daq_type);
        let host = ca.host(&format!("{}.X", epics_id)).await?;
        let mac = lookup_mac(host_ip(&host)).await;
        Self::with_mac(ca, epics_id, mac).await
    }

    /// Open a record whose MAC address is already known
    pub async fn with_mac(ca: Arc<dyn ChannelAccess>, epics_id: String, mac: String) -> Result<Self> {
        let bpm = Self { ca, epics_id, mac };
        // Passive scanning so the record only updates when processed
        bpm.ca.put(&bpm.pv(".SCAN"), 0.0).await?;
        bpm.trigger().await?;
        info!(epics_id = %bpm.epics_id, mac = %bpm.mac, "Opened link with Libera BPM");
        Ok(bpm)
    }

    fn pv(&self, field: &str) -> String {
        format!("{}{}", self.epics_id, field)
    }

    async fn trigger(&self) -> Result<()> {
        self.ca.put(&self.pv(".PROC"), 1.0).await
    }

    /// Process the record, then average one of its waveforms
    async fn read_mean(&self, field: &str) -> Result<f64> {
        self.trigger().await?;
        self.waveform_mean(field).await
    }

    /// Average a waveform from the last acquisition without processing again
    async fn waveform_mean(&self, field: &str) -> Result<f64> {
        let pv = self.pv(field);
        let values = self.ca.get(&pv).await?;
        debug!(pv = %pv, samples = values.len(), "Libera waveform read");
        match mean(&values) {
            Some(value) => Ok(value),
            None => bail!(HarnessError::ChannelAccess {
                pv,
                reason: "empty waveform".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BpmDevice for SparkErEpicsBpm {
    async fn x_position(&self) -> Result<f64> {
        Ok(self.read_mean(".X").await? / NM_PER_MM)
    }

    async fn y_position(&self) -> Result<f64> {
        Ok(self.read_mean(".Y").await? / NM_PER_MM)
    }

    async fn beam_current(&self) -> Result<f64> {
        self.read_mean(".Sum").await
    }

    async fn input_power(&self) -> Result<f64> {
        self.read_mean(".Sum").await
    }

    async fn raw_buttons(&self) -> Result<ButtonSignals> {
        // All four buttons from the same acquisition
        self.trigger().await?;
        Ok(ButtonSignals::new(
            self.waveform_mean(".A").await?.round(),
            self.waveform_mean(".B").await?.round(),
            self.waveform_mean(".C").await?.round(),
            self.waveform_mean(".D").await?.round(),
        ))
    }

    async fn normalised_buttons(&self) -> Result<ButtonSignals> {
        Ok(self.raw_buttons().await?.normalised())
    }

    async fn adc_sum(&self) -> Result<f64> {
        Ok(self.read_mean(".Sum").await?.round())
    }

    async fn device_id(&self) -> Result<String> {
        Ok(format!(
            "Libera BPM with the Epics ID \"{}\" and the MAC Address \"{}\"",
            self.epics_id, self.mac
        ))
    }

    fn input_tolerance(&self) -> f64 {
        -40.0
    }
}

// =============================================================================
// Electron
// =============================================================================

/// Libera Electron driver
pub struct ElectronBpm {
    ca: Arc<dyn ChannelAccess>,
    epics_id: String,
    mac: String,
}

impl ElectronBpm {
    /// Open the unit whose PVs start with `epics_id` (e.g. `TS-DI-EBPM-04:`)
    pub async fn connect(ca: Arc<dyn ChannelAccess>, epics_id: &str) -> Result<Self> {
        let host = ca.host(&format!("{}SA:X", epics_id)).await?;
        let mac = lookup_mac(host_ip(&host)).await;
        Ok(Self::with_mac(ca, epics_id.to_string(), mac))
    }

    /// Open a unit whose MAC address is already known
    pub fn with_mac(ca: Arc<dyn ChannelAccess>, epics_id: String, mac: String) -> Self {
        info!(epics_id = %epics_id, mac = %mac, "Opened connection to Libera Electron");
        Self { ca, epics_id, mac }
    }

    async fn read_scalar(&self, field: &str) -> Result<f64> {
        let pv = format!("{}{}", self.epics_id, field);
        let values = self.ca.get(&pv).await?;
        match values.first() {
            Some(value) => Ok(*value),
            None => bail!(HarnessError::ChannelAccess {
                pv,
                reason: "empty reply".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BpmDevice for ElectronBpm {
    async fn x_position(&self) -> Result<f64> {
        self.read_scalar("SA:X").await
    }

    async fn y_position(&self) -> Result<f64> {
        self.read_scalar("SA:Y").await
    }

    async fn beam_current(&self) -> Result<f64> {
        self.read_scalar("SA:CURRENT").await
    }

    async fn input_power(&self) -> Result<f64> {
        self.read_scalar("SA:POWER").await
    }

    async fn raw_buttons(&self) -> Result<ButtonSignals> {
        Ok(ButtonSignals::new(
            self.read_scalar("SA:A").await?,
            self.read_scalar("SA:B").await?,
            self.read_scalar("SA:C").await?,
            self.read_scalar("SA:D").await?,
        ))
    }

    async fn normalised_buttons(&self) -> Result<ButtonSignals> {
        Ok(ButtonSignals::new(
            self.read_scalar("SA:AN").await?,
            self.read_scalar("SA:BN").await?,
            self.read_scalar("SA:CN").await?,
            self.read_scalar("SA:DN").await?,
        ))
    }

    async fn adc_sum(&self) -> Result<f64> {
        Ok(self.raw_buttons().await?.sum())
    }

    async fn device_id(&self) -> Result<String> {
        Ok(format!(
            "Libera Electron BPM with the Epics ID \"{}\" and the MAC Address \"{}\"",
            self.epics_id, self.mac
        ))
    }

    fn input_tolerance(&self) -> f64 {
        -20.0
    }
}
