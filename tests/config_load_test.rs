//! Configuration loading from files and the environment

use std::fs;
use std::path::PathBuf;

use bpm_harness::config::{
    AttenuatorConfig, BpmConfig, ConfigError, GateSourceConfig, RfSourceConfig,
};
use bpm_harness::{HarnessConfig, SweepDefinition};
use serial_test::serial;
use tempfile::TempDir;

const LAB_CONFIG: &str = r#"
[application]
name = "Spark ER acceptance"
author = "Diagnostics Group"
settling_time_s = 1.5

[devices.rf_source]
kind = "rigol_dsg3030"
host = "172.23.252.51"

[devices.gate_source]
kind = "rigol_dsg3030"
host = "172.23.252.51"
timeout_ms = 2000

[devices.attenuator]
kind = "rc4dat"
host = "172.23.244.105"
port = 2323

[devices.bpm]
kind = "spark_er_scpi"
host = "172.23.240.105"

[[sweeps]]
type = "power_dependence"
start_power = -80
end_power = -40
samples = 5

[[sweeps]]
type = "grid_raster"
quantised = false
settling_time_s = 0.2
"#;

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("harness.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
#[serial]
fn test_load_lab_config_from_file() {
    let dir = TempDir::new().unwrap();
    let config = HarnessConfig::load_from(write_config(&dir, LAB_CONFIG)).unwrap();

    assert_eq!(config.application.name, "Spark ER acceptance");
    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.application.settling_time_s, 1.5);

    match &config.devices.rf_source {
        RfSourceConfig::RigolDsg3030(telnet) => {
            assert_eq!(telnet.host, "172.23.252.51");
            assert_eq!(telnet.port, None);
            assert_eq!(telnet.timeout_ms, 1000);
        }
        other => panic!("unexpected RF source {:?}", other),
    }
    match &config.devices.gate_source {
        Some(GateSourceConfig::RigolDsg3030(telnet)) => assert_eq!(telnet.timeout_ms, 2000),
        other => panic!("unexpected gate source {:?}", other),
    }
    match &config.devices.attenuator {
        Some(AttenuatorConfig::Rc4dat(telnet)) => assert_eq!(telnet.port_or(23), 2323),
        other => panic!("unexpected attenuator {:?}", other),
    }
    match &config.devices.bpm {
        BpmConfig::SparkErScpi(spark) => {
            assert_eq!(spark.host, "172.23.240.105");
            assert!(spark.auto_trigger);
        }
        other => panic!("unexpected BPM {:?}", other),
    }

    assert_eq!(config.sweeps.len(), 2);
    match &config.sweeps[0] {
        SweepDefinition::PowerDependence(params) => {
            assert_eq!(params.start_power, -80.0);
            assert_eq!(params.samples, 5);
            assert_eq!(params.settling_time_s, None);
        }
        other => panic!("unexpected sweep {:?}", other),
    }
    assert_eq!(config.sweeps[1].name(), "Beam position linear raster scan test");
    assert_eq!(config.sweeps[1].settling_time_s(), Some(0.2));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, LAB_CONFIG);

    std::env::set_var("BPM_HARNESS_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("BPM_HARNESS_APPLICATION__SETTLING_TIME_S", "0.25");
    let result = HarnessConfig::load_from(&path);
    std::env::remove_var("BPM_HARNESS_APPLICATION__LOG_LEVEL");
    std::env::remove_var("BPM_HARNESS_APPLICATION__SETTLING_TIME_S");

    let config = result.unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.application.settling_time_s, 0.25);
    assert_eq!(config.application.name, "Spark ER acceptance");
}

#[test]
#[serial]
fn test_invalid_env_override_fails_validation() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, LAB_CONFIG);

    std::env::set_var("BPM_HARNESS_APPLICATION__LOG_LEVEL", "verbose");
    let result = HarnessConfig::load_from(&path);
    std::env::remove_var("BPM_HARNESS_APPLICATION__LOG_LEVEL");

    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

#[test]
#[serial]
fn test_missing_devices_is_load_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[application]\nname = \"No bench\"\n");
    assert!(matches!(
        HarnessConfig::load_from(path),
        Err(ConfigError::LoadError(_))
    ));
}

#[test]
#[serial]
fn test_shipped_config_loads() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/harness.toml");
    let config = HarnessConfig::load_from(path).unwrap();

    assert!(matches!(
        config.devices.rf_source,
        RfSourceConfig::Simulated { .. }
    ));
    assert_eq!(config.devices.bpm, BpmConfig::Simulated);
    assert!(!config.sweeps.is_empty());
}
