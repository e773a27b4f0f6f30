//! Harness configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/harness.toml` by default)
//! 2. environment variables prefixed with `BPM_HARNESS_`, nested keys
//!    separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! BPM_HARNESS_APPLICATION__LOG_LEVEL=debug
//! BPM_HARNESS_APPLICATION__SETTLING_TIME_S=0.5
//! BPM_HARNESS_DEVICES__RF_SOURCE__HOST=172.23.252.51
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "BPM Test Report"
//! settling_time_s = 3.0
//!
//! [devices.rf_source]
//! kind = "rigol_dsg3030"
//! host = "172.23.252.51"
//!
//! [devices.bpm]
//! kind = "spark_er_scpi"
//! host = "172.23.240.105"
//!
//! [[sweeps]]
//! type = "power_dependence"
//! start_power = -70.0
//! end_power = -60.0
//! samples = 30
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error::AppResult;
use crate::hardware::capabilities::MAX_ATTENUATION_DB;
use crate::sweeps::{settling_duration, SweepDefinition};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/harness.toml";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "BPM_HARNESS_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Devices on the bench
    pub devices: DevicesConfig,
    /// Sweeps to run, in order
    #[serde(default)]
    pub sweeps: Vec<SweepDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Report title
    #[serde(default = "default_name")]
    pub name: String,
    /// Report author
    #[serde(default = "default_author")]
    pub author: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory the report is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Settling time after each set-point change, in seconds
    #[serde(default = "default_settling_time")]
    pub settling_time_s: f64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            author: default_author(),
            log_level: default_log_level(),
            output_dir: default_output_dir(),
            settling_time_s: default_settling_time(),
        }
    }
}

impl ApplicationConfig {
    /// Settling time as a `Duration`
    ///
    /// # Errors
    /// Returns `HarnessError::OutOfRange` for negative or non-finite values.
    pub fn settling_time(&self) -> AppResult<Duration> {
        settling_duration(self.settling_time_s)
    }
}

/// Device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// RF signal generator
    pub rf_source: RfSourceConfig,
    /// Gate source, needed by fill pattern sweeps
    #[serde(default)]
    pub gate_source: Option<GateSourceConfig>,
    /// Programmable attenuator, needed by position sweeps
    #[serde(default)]
    pub attenuator: Option<AttenuatorConfig>,
    /// BPM under test
    pub bpm: BpmConfig,
}

impl DevicesConfig {
    /// Every device simulated
    pub fn simulated() -> Self {
        Self {
            rf_source: RfSourceConfig::Simulated { limit_dbm: None },
            gate_source: Some(GateSourceConfig::Simulated),
            attenuator: Some(AttenuatorConfig::Simulated),
            bpm: BpmConfig::Simulated,
        }
    }
}

/// RF signal generator selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RfSourceConfig {
    /// In-memory generator
    Simulated {
        /// Output power ceiling in dBm, applied when it is below the BPM's
        /// input tolerance
        #[serde(default)]
        limit_dbm: Option<f64>,
    },
    /// Rigol DSG3030 over Telnet
    RigolDsg3030(TelnetConfig),
}

/// Gate source selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateSourceConfig {
    /// In-memory pulse source
    Simulated,
    /// Pulse modulation of a Rigol DSG3030
    RigolDsg3030(TelnetConfig),
}

/// Attenuator selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttenuatorConfig {
    /// In-memory attenuator
    Simulated,
    /// Mini-Circuits RC4DAT-6G-95 over Telnet
    Rc4dat(TelnetConfig),
}

/// BPM selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BpmConfig {
    /// BPM following the simulated RF chain
    Simulated,
    /// Libera Spark ER over its SCPI socket
    SparkErScpi(SparkScpiConfig),
    /// Libera Spark ER/XR through EPICS
    SparkErEpics {
        /// PV prefix of the unit
        database: String,
        /// Acquisition type, e.g. `sa`
        #[serde(default = "default_daq_type")]
        daq_type: String,
    },
    /// Libera Electron through EPICS
    ElectronEpics {
        /// PV prefix of the unit, e.g. `TS-DI-EBPM-04:`
        epics_id: String,
    },
}

impl BpmConfig {
    /// Whether the BPM is reached through channel access
    pub fn uses_channel_access(&self) -> bool {
        matches!(self, Self::SparkErEpics { .. } | Self::ElectronEpics { .. })
    }
}

/// Spark ER SCPI settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparkScpiConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port, 23 when omitted
    #[serde(default)]
    pub port: Option<u16>,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Send a software trigger before each acquisition
    #[serde(default = "default_auto_trigger")]
    pub auto_trigger: bool,
}

impl SparkScpiConfig {
    /// Connection part of the settings
    pub fn connection(&self) -> TelnetConfig {
        TelnetConfig {
            host: self.host.clone(),
            port: self.port,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Telnet connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelnetConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port; the instrument's usual port when omitted
    #[serde(default)]
    pub port: Option<u16>,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl TelnetConfig {
    /// Port, falling back to `default_port`
    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }

    /// Reply timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "BPM Test Report".to_string()
}

fn default_author() -> String {
    "Diagnostics Group".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_settling_time() -> f64 {
    1.0
}


fn default_timeout_ms() -> u64 {
    1000
}

fn default_auto_trigger() -> bool {
    true
}

fn default_daq_type() -> String {
    "sa".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl HarnessConfig {
    /// Load configuration from `config/harness.toml` and environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Replace every device with its simulated counterpart
    pub fn into_simulated(mut self) -> Self {
        self.devices = DevicesConfig::simulated();
        self
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Settling times are finite and not negative
    /// - Connection settings have a host and a non-zero timeout
    /// - Sweep sample counts are non-zero and attenuations within 0-95 dB
    /// - Gate sweeps have a gate source, attenuation sweeps an attenuator
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        check_settling("application.settling_time_s", self.application.settling_time_s)?;

        if let RfSourceConfig::RigolDsg3030(telnet) = &self.devices.rf_source {
            check_telnet("rf_source", telnet)?;
        }
        if let Some(GateSourceConfig::RigolDsg3030(telnet)) = &self.devices.gate_source {
            check_telnet("gate_source", telnet)?;
        }
        if let Some(AttenuatorConfig::Rc4dat(telnet)) = &self.devices.attenuator {
            check_telnet("attenuator", telnet)?;
        }
        match &self.devices.bpm {
            BpmConfig::SparkErScpi(spark) => check_telnet("bpm", &spark.connection())?,
            BpmConfig::SparkErEpics { database, .. } if database.is_empty() => {
                return Err(ConfigError::ValidationError(
                    "bpm: 'database' cannot be empty".to_string(),
                ))
            }
            BpmConfig::ElectronEpics { epics_id } if epics_id.is_empty() => {
                return Err(ConfigError::ValidationError(
                    "bpm: 'epics_id' cannot be empty".to_string(),
                ))
            }
            _ => {}
        }

        for (index, sweep) in self.sweeps.iter().enumerate() {
            self.validate_sweep(index, sweep)?;
        }

        Ok(())
    }

    /// Validate one sweep definition
    fn validate_sweep(&self, index: usize, sweep: &SweepDefinition) -> Result<(), ConfigError> {
        let label = format!("sweep {} ({})", index, sweep.name());

        if sweep.needs_gate() && self.devices.gate_source.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "{} requires a gate source",
                label
            )));
        }
        if sweep.needs_attenuator() && self.devices.attenuator.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "{} requires a programmable attenuator",
                label
            )));
        }
        if let Some(settling) = sweep.settling_time_s() {
            check_settling(&label, settling)?;
        }

        match sweep {
            SweepDefinition::PowerDependence(p) => check_samples(&label, "samples", p.samples),
            SweepDefinition::FixedAmplitudeFillPattern(p) => {
                check_samples(&label, "samples", p.samples)?;
                check_period(&label, p.pulse_period)
            }
            SweepDefinition::ScaledAmplitudeFillPattern(p) => {
                check_samples(&label, "samples", p.samples)?;
                check_period(&label, p.pulse_period)
            }
            SweepDefinition::AttenuationPermutation(p) => {
                check_samples(&label, "attenuator_steps", p.attenuator_steps)?;
                check_attenuation(&label, "attenuator_min", p.attenuator_min)?;
                check_attenuation(&label, "attenuator_max", p.attenuator_max)?;
                if p.attenuator_min > p.attenuator_max {
                    return Err(ConfigError::ValidationError(format!(
                        "{}: attenuator_min {} is above attenuator_max {}",
                        label, p.attenuator_min, p.attenuator_max
                    )));
                }
                Ok(())
            }
            SweepDefinition::GridRaster(p) => {
                check_samples(&label, "x_points", p.x_points)?;
                check_samples(&label, "y_points", p.y_points)?;
                check_attenuation(&label, "nominal_attenuation", p.nominal_attenuation)
            }
        }
    }
}

fn check_settling(label: &str, seconds: f64) -> Result<(), ConfigError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "{}: invalid settling time {}s. Must be 0 or more",
            label, seconds
        )));
    }
    Ok(())
}

fn check_telnet(label: &str, telnet: &TelnetConfig) -> Result<(), ConfigError> {
    if telnet.host.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{}: 'host' cannot be empty",
            label
        )));
    }
    if telnet.timeout_ms == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}: 'timeout_ms' must be > 0",
            label
        )));
    }
    Ok(())
}

fn check_samples(label: &str, field: &str, count: usize) -> Result<(), ConfigError> {
    if count == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}: '{}' must be > 0",
            label, field
        )));
    }
    Ok(())
}

fn check_period(label: &str, period: f64) -> Result<(), ConfigError> {
    if period.is_nan() || period <= 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "{}: 'pulse_period' must be > 0",
            label
        )));
    }
    Ok(())
}

fn check_attenuation(label: &str, field: &str, db: f64) -> Result<(), ConfigError> {
    if !(0.0..=MAX_ATTENUATION_DB).contains(&db) {
        return Err(ConfigError::ValidationError(format!(
            "{}: '{}' {} dB is outside 0-{} dB",
            label, field, db, MAX_ATTENUATION_DB
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweeps::{GridRasterParams, PowerDependenceParams};

    fn simulated_config() -> HarnessConfig {
        HarnessConfig {
            application: ApplicationConfig::default(),
            devices: DevicesConfig::simulated(),
            sweeps: vec![],
        }
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(simulated_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = simulated_config();
        config.application.log_level = "verbose".to_string();
        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_negative_settling_time() {
        let mut config = simulated_config();
        config.application.settling_time_s = -1.0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("invalid settling time"));
    }

    #[test]
    fn test_gate_sweep_without_gate_source() {
        let mut config = simulated_config();
        config.devices.gate_source = None;
        config.sweeps = vec![SweepDefinition::FixedAmplitudeFillPattern(
            Default::default(),
        )];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("requires a gate source"));
    }

    #[test]
    fn test_zero_samples_rejected() {
        let mut config = simulated_config();
        config.sweeps = vec![SweepDefinition::PowerDependence(PowerDependenceParams {
            samples: 0,
            ..Default::default()
        })];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("'samples' must be > 0"));
    }

    #[test]
    fn test_nominal_attenuation_out_of_range() {
        let mut config = simulated_config();
        config.sweeps = vec![SweepDefinition::GridRaster(GridRasterParams {
            nominal_attenuation: 96.0,
            ..Default::default()
        })];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("nominal_attenuation"));
    }

    #[test]
    fn test_parse_toml() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [application]
            settling_time_s = 0.5

            [devices.rf_source]
            kind = "rigol_dsg3030"
            host = "172.23.252.51"

            [devices.gate_source]
            kind = "simulated"

            [devices.bpm]
            kind = "spark_er_scpi"
            host = "172.23.240.105"
            auto_trigger = false

            [[sweeps]]
            type = "power_dependence"
            start_power = -70.0
            end_power = -60.0
            samples = 30

            [[sweeps]]
            type = "scaled_amplitude_fill_pattern"
            desired_power = -60.0
            "#,
        )
        .unwrap();

        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.application.settling_time().unwrap(), Duration::from_millis(500));
        match &config.devices.rf_source {
            RfSourceConfig::RigolDsg3030(telnet) => {
                assert_eq!(telnet.port_or(crate::hardware::rigol_dsg3030::DEFAULT_PORT), 5555);
                assert_eq!(telnet.timeout(), Duration::from_secs(1));
            }
            other => panic!("unexpected rf source {:?}", other),
        }
        assert_eq!(
            config.devices.bpm,
            BpmConfig::SparkErScpi(SparkScpiConfig {
                host: "172.23.240.105".to_string(),
                port: None,
                timeout_ms: 1000,
                auto_trigger: false,
            })
        );
        assert_eq!(config.sweeps.len(), 2);
        assert!(config.sweeps[1].needs_gate());
    }

    #[test]
    fn test_unknown_device_kind() {
        let result = HarnessConfig::from_toml_str(
            r#"
            [devices.rf_source]
            kind = "keysight"
            [devices.bpm]
            kind = "simulated"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_into_simulated() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [devices.rf_source]
            kind = "rigol_dsg3030"
            host = "172.23.252.51"
            [devices.bpm]
            kind = "electron_epics"
            epics_id = "TS-DI-EBPM-04:"
            "#,
        )
        .unwrap()
        .into_simulated();
        assert_eq!(config.devices.bpm, BpmConfig::Simulated);
        assert_eq!(config.devices.attenuator, Some(AttenuatorConfig::Simulated));
    }
}
