//! Libera Spark ER BPM over its SCPI socket interface.
//!
//! Readings are taken from turn-by-turn buffers and averaged on the host:
//!
//! | Command        | Reply layout          | Units |
//! |----------------|-----------------------|-------|
//! | `TBT_XY 100`   | x0 y0 x1 y1 ...       | um    |
//! | `TBT_QSUM 100` | q0 sum0 q1 sum1 ...   | counts|
//! | `ADC 200`      | a0 b0 c0 d0 a1 ...    | counts|
//!
//! Without a hardware trigger connected the unit only refreshes its buffers
//! on a software `TRIG`, which is sent before every acquisition when
//! `auto_trigger` is set.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::HarnessError;
use crate::hardware::arp::lookup_mac;
use crate::hardware::capabilities::BpmDevice;
use crate::hardware::transport::{LineTransport, TelnetTransportBuilder};
use crate::position::ButtonSignals;
use crate::units::{deinterleave, mean, parse_f64_list, rms};

/// Telnet port of the SCPI socket
pub const DEFAULT_PORT: u16 = 23;

const UM_PER_MM: f64 = 1000.0;

/// Spark ER driver
pub struct SparkErScpiBpm {
    transport: Arc<dyn LineTransport>,
    mac: String,
    auto_trigger: bool,
}

impl SparkErScpiBpm {
    /// Connect over Telnet and start acquisition
    ///
    /// The MAC address for the device ID is looked up from the host's ARP
    /// cache.
    pub async fn connect(host: &str, port: u16, timeout: Duration, auto_trigger: bool) -> Result<Self> {
        let transport = TelnetTransportBuilder::new(host, port)
            .with_timeout(timeout)
            .build()
            .await?;
        let mac = lookup_mac(host).await;
        Self::with_transport(Arc::new(transport), mac, auto_trigger).await
    }

    /// Start acquisition over an existing transport
    pub async fn with_transport(
        transport: Arc<dyn LineTransport>,
        mac: String,
        auto_trigger: bool,
    ) -> Result<Self> {
        let bpm = Self {
            transport,
            mac,
            auto_trigger,
        };
        bpm.transport.query("START").await?;
        bpm.trigger().await?;
        info!(mac = %bpm.mac, address = %bpm.transport.address(), "Opened connection to Spark BPM");
        Ok(bpm)
    }

    async fn trigger(&self) -> Result<()> {
        if self.auto_trigger {
            self.transport.query("TRIG").await?;
        }
        Ok(())
    }

    /// Trigger, then read a buffer of interleaved samples
    async fn acquire(&self, command: &str) -> Result<Vec<f64>> {
        self.trigger().await?;
        let reply = self.transport.query(command).await?;
        let samples = parse_f64_list(&reply)?;
        debug!(command, samples = samples.len(), "Spark acquisition");
        Ok(samples)
    }

    /// Mean of every `stride`-th sample starting at `offset`
    async fn mean_channel(&self, command: &str, offset: usize, stride: usize) -> Result<f64> {
        let samples = self.acquire(command).await?;
        match mean(&deinterleave(&samples, offset, stride)) {
            Some(value) => Ok(value),
            None => bail!(HarnessError::parse(command, "empty sample buffer")),
        }
    }
}

#[async_trait]
impl BpmDevice for SparkErScpiBpm {
    async fn x_position(&self) -> Result<f64> {
        Ok(self.mean_channel("TBT_XY 100", 0, 2).await? / UM_PER_MM)
    }

    async fn y_position(&self) -> Result<f64> {
        Ok(self.mean_channel("TBT_XY 100", 1, 2).await? / UM_PER_MM)
    }

    async fn beam_current(&self) -> Result<f64> {
        self.mean_channel("TBT_QSUM 100", 1, 2).await
    }

    async fn input_power(&self) -> Result<f64> {
        self.mean_channel("TBT_QSUM 100", 1, 2).await
    }

    async fn raw_buttons(&self) -> Result<ButtonSignals> {
        let samples = self.acquire("ADC 200").await?;
        let mut levels = [0.0; 4];
        for (offset, level) in levels.iter_mut().enumerate() {
            *level = match rms(&deinterleave(&samples, offset, 4)) {
                Some(value) => value,
                None => bail!(HarnessError::parse("ADC 200", "empty sample buffer")),
            };
        }
        Ok(ButtonSignals::new(levels[0], levels[1], levels[2], levels[3]))
    }

    async fn normalised_buttons(&self) -> Result<ButtonSignals> {
        Ok(self.raw_buttons().await?.normalised())
    }

    async fn adc_sum(&self) -> Result<f64> {
        Ok(self.mean_channel("TBT_QSUM 100", 1, 2).await?.round())
    }

    async fn device_id(&self) -> Result<String> {
        Ok(format!("Spark BPM \"{}\"", self.mac))
    }

    fn input_tolerance(&self) -> f64 {
        -40.0
    }
}
