//! Rigol DSG3030 RF signal generator
//!
//! The DSG3030 provides both the RF stimulus and, through its pulse modulator,
//! the gate. The two roles use separate connections to the same SCPI socket
//! server (port 5555), one per driver.
//!
//! Protocol Overview:
//! - ASCII SCPI commands terminated by `\r\n`
//! - Query replies terminated by `\n`
//! - Power in dBm (`UNIT:POW dBm` is sent before every level change)
//! - Frequencies written in MHz, pulse timing written in us
//!
//! # Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use bpm_harness::hardware::rigol_dsg3030::Rigol3030RfSource;
//! use bpm_harness::hardware::capabilities::RfSource;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let rf = Rigol3030RfSource::connect("172.23.252.51", 5555, Duration::from_secs(1), -40.0).await?;
//!     rf.set_frequency(499.6817682).await?;
//!     rf.set_output_power(-60.0).await?;
//!     rf.turn_on_rf().await?;
//!     rf.shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::hardware::capabilities::{check_dutycycle, check_non_negative, GateSource, RfSource};
use crate::hardware::transport::{LineTransport, TelnetTransport};
use crate::units::{parse_f64, parse_quantity, Quantity};

/// SCPI socket port of the DSG3030
pub const DEFAULT_PORT: u16 = 5555;

/// Identification prefix every DSG3030 answers `*IDN?` with
const IDN_PREFIX: &str = "Rigol Technologies,DSG3030";

/// Query `*IDN?` and make sure a DSG3030 answered.
async fn identify(transport: &dyn LineTransport) -> Result<String> {
    let idn = transport
        .query("*IDN?")
        .await
        .with_context(|| format!("Identification query to {} failed", transport.address()))?;
    if !idn.starts_with(IDN_PREFIX) {
        bail!(HarnessError::WrongDevice {
            expected: "Rigol DSG3030",
            found: idn,
        });
    }
    Ok(idn)
}

fn parse_on_off(reply: &str) -> Result<bool> {
    match reply.trim() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        other => bail!(HarnessError::parse(other, "expected 0/1 state")),
    }
}

// =============================================================================
// RF source
// =============================================================================

/// DSG3030 RF output
///
/// The output power limit is kept locally as well as on the instrument so
/// requests above it are capped before they are sent.
pub struct Rigol3030RfSource {
    transport: Arc<dyn LineTransport>,
    idn: String,
    limit: RwLock<f64>,
}

impl Rigol3030RfSource {
    /// Connect over Telnet and initialise
    ///
    /// # Arguments
    /// * `host` - IP address of the generator
    /// * `port` - SCPI port (usually [`DEFAULT_PORT`])
    /// * `timeout` - Per-reply timeout
    /// * `limit` - Output power limit in dBm
    pub async fn connect(host: &str, port: u16, timeout: Duration, limit: f64) -> Result<Self> {
        let transport = TelnetTransport::connect(host, port, timeout).await?;
        Self::with_transport(Arc::new(transport), limit).await
    }

    /// Initialise over an existing transport
    ///
    /// Checks the identification, switches the RF output off and applies the
    /// output power limit.
    ///
    /// # Errors
    /// Returns `HarnessError::WrongDevice` if something other than a DSG3030
    /// answers.
    pub async fn with_transport(transport: Arc<dyn LineTransport>, limit: f64) -> Result<Self> {
        let idn = identify(transport.as_ref()).await?;
        let source = Self {
            transport,
            idn,
            limit: RwLock::new(limit),
        };
        source.turn_off_rf().await?;
        source.set_output_power_limit(limit).await?;
        info!(device = %source.idn, "Opened connection to RF source");
        Ok(source)
    }

    /// Switch the RF output off before the connection is dropped
    pub async fn shutdown(&self) -> Result<()> {
        self.turn_off_rf().await?;
        info!(device = %self.idn, "Closed connection to RF source");
        Ok(())
    }
}

#[async_trait]
impl RfSource for Rigol3030RfSource {
    async fn device_id(&self) -> Result<String> {
        Ok(format!("RF Source {}", self.idn))
    }

    async fn set_frequency(&self, mhz: f64) -> Result<Quantity> {
        check_non_negative("Frequency", mhz)?;
        self.transport.write(&format!("FREQ {}MHz", mhz)).await?;
        self.frequency().await
    }

    async fn frequency(&self) -> Result<Quantity> {
        Ok(parse_quantity(&self.transport.query("FREQ?").await?)?)
    }

    async fn set_output_power(&self, dbm: f64) -> Result<Quantity> {
        let limit = *self.limit.read().await;
        let power = if dbm > limit {
            warn!(
                requested = dbm,
                limit, "Power limit has been reached, output will be capped"
            );
            limit
        } else {
            dbm
        };
        self.transport.write("UNIT:POW dBm").await?;
        self.transport.write(&format!("LEV {}", power)).await?;
        self.output_power().await
    }

    async fn output_power(&self) -> Result<Quantity> {
        let level = self.transport.query("LEV?").await?;
        let unit = self.transport.query("UNIT:POW?").await?;
        Ok(parse_quantity(&format!("{}{}", level, unit))?)
    }

    async fn turn_on_rf(&self) -> Result<bool> {
        self.transport.write("OUTP ON").await?;
        self.output_state().await
    }

    async fn turn_off_rf(&self) -> Result<bool> {
        self.transport.write("OUTP OFF").await?;
        self.output_state().await
    }

    async fn output_state(&self) -> Result<bool> {
        Ok(self.transport.query("OUTP?").await?.trim() == "1")
    }

    async fn set_output_power_limit(&self, dbm: f64) -> Result<Quantity> {
        *self.limit.write().await = dbm;
        self.transport.write("UNIT:POW dBm").await?;
        self.transport.write(&format!("LEV:LIM {}", dbm)).await?;
        self.output_power_limit().await
    }

    async fn output_power_limit(&self) -> Result<Quantity> {
        let limit = self.transport.query("LEV:LIM?").await?;
        let unit = self.transport.query("UNIT:POW?").await?;
        let value = parse_f64(&limit)?;
        *self.limit.write().await = value;
        Ok(Quantity {
            value,
            text: format!("{}{}", limit, unit),
        })
    }
}

// =============================================================================
// Gate source
// =============================================================================

/// DSG3030 pulse modulator used as a gate
pub struct Rigol3030GateSource {
    transport: Arc<dyn LineTransport>,
    idn: String,
}

impl Rigol3030GateSource {
    /// Connect over Telnet and initialise
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let transport = TelnetTransport::connect(host, port, timeout).await?;
        Self::with_transport(Arc::new(transport)).await
    }

    /// Initialise over an existing transport
    ///
    /// Modulation is switched off and the internal pulse generator is set to
    /// free-run with a 3 us period and zero width.
    pub async fn with_transport(transport: Arc<dyn LineTransport>) -> Result<Self> {
        let idn = identify(transport.as_ref()).await?;
        let gate = Self { transport, idn };
        gate.turn_off_modulation().await?;
        gate.transport.write("PULM:SOUR INT").await?;
        gate.transport.write("PULM:TRIG:MODE AUTO").await?;
        gate.set_pulse_period(3.0).await?;
        gate.set_pulse_dutycycle(0.0).await?;
        info!(device = %gate.idn, "Opened connection to gate source");
        Ok(gate)
    }

    /// Invert (true) or restore (false) the pulse polarity
    ///
    /// Returns the polarity reported by the instrument.
    pub async fn invert_pulse_polarity(&self, invert: bool) -> Result<String> {
        let command = if invert { "PULM:POL INV" } else { "PULM:POL NORM" };
        self.transport.write(command).await?;
        self.pulse_polarity().await
    }

    /// Current pulse polarity (`NORM` or `INV`)
    pub async fn pulse_polarity(&self) -> Result<String> {
        self.transport.query("PULM:POL?").await
    }

    /// Switch modulation off before the connection is dropped
    pub async fn shutdown(&self) -> Result<()> {
        self.turn_off_modulation().await?;
        info!(device = %self.idn, "Closed connection to gate source");
        Ok(())
    }
}

#[async_trait]
impl GateSource for Rigol3030GateSource {
    async fn device_id(&self) -> Result<String> {
        Ok(format!("Gating Device {}", self.idn))
    }

    async fn turn_on_modulation(&self) -> Result<bool> {
        self.transport.write("PULM:OUT:STAT ON").await?;
        self.transport.write("PULM:STAT ON").await?;
        self.transport.write("MOD:STAT ON").await?;
        self.modulation_state().await
    }

    async fn turn_off_modulation(&self) -> Result<bool> {
        self.transport.write("PULM:OUT:STAT OFF").await?;
        self.transport.write("PULM:STAT OFF").await?;
        self.transport.write("MOD:STAT OFF").await?;
        self.modulation_state().await
    }

    async fn modulation_state(&self) -> Result<bool> {
        parse_on_off(&self.transport.query("MOD:STAT?").await?)
    }

    async fn set_pulse_period(&self, us: f64) -> Result<Quantity> {
        check_non_negative("Pulse period", us)?;
        self.transport.write(&format!("PULM:PER {}us", us)).await?;
        self.pulse_period().await
    }

    async fn pulse_period(&self) -> Result<Quantity> {
        Ok(parse_quantity(&self.transport.query("PULM:PER?").await?)?)
    }

    async fn set_pulse_dutycycle(&self, dutycycle: f64) -> Result<f64> {
        check_dutycycle(dutycycle)?;
        let width = self.pulse_period().await?.value * dutycycle;
        self.transport.write(&format!("PULM:WIDT {}us", width)).await?;
        self.pulse_dutycycle().await
    }

    async fn pulse_dutycycle(&self) -> Result<f64> {
        let width = parse_quantity(&self.transport.query("PULM:WIDT?").await?)?.value;
        let period = self.pulse_period().await?.value;
        if period == 0.0 {
            bail!(HarnessError::parse("0", "pulse period is zero"));
        }
        Ok(width / period)
    }
}
