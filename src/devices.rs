//! Build a [`TestBench`] from the device section of the configuration.
//!
//! EPICS-backed BPMs need a channel access client. The harness does not ship
//! one; embedders pass their own implementation of [`ChannelAccess`].

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{AttenuatorConfig, BpmConfig, DevicesConfig, GateSourceConfig, RfSourceConfig};
use crate::error::HarnessError;
use crate::hardware::simulated::DEFAULT_RF_LIMIT_DBM;
use crate::hardware::{
    rc4dat, rigol_dsg3030, spark_er, Attenuator, BpmDevice, ChannelAccess, ElectronBpm,
    GateSource, Rc4datAttenuator, RfSource, Rigol3030GateSource, Rigol3030RfSource,
    SimulatedAttenuator, SimulatedBpm, SimulatedGateSource, SimulatedRfSource, SparkErEpicsBpm,
    SparkErScpiBpm,
};
use crate::sweeps::TestBench;

/// Connect every configured device and limit the RF output to the BPM's
/// input tolerance, or to the simulated generator's own ceiling when lower.
pub async fn build_bench(
    devices: &DevicesConfig,
    channel_access: Option<Arc<dyn ChannelAccess>>,
) -> Result<TestBench> {
    let rf = build_rf_source(&devices.rf_source).await?;
    let gate = match &devices.gate_source {
        Some(config) => Some(build_gate_source(config).await?),
        None => None,
    };
    let attenuator = match &devices.attenuator {
        Some(config) => Some(build_attenuator(config).await?),
        None => None,
    };
    let bpm = build_bpm(&devices.bpm, rf.clone(), gate.clone(), channel_access).await?;

    let mut bench = TestBench::new(rf, bpm);
    if let Some(gate) = gate {
        bench = bench.with_gate(gate);
    }
    if let Some(attenuator) = attenuator {
        bench = bench.with_attenuator(attenuator);
    }
    let tolerance = bench.protect_bpm().await?;
    if let RfSourceConfig::Simulated {
        limit_dbm: Some(ceiling),
    } = devices.rf_source
    {
        if ceiling < tolerance {
            bench.rf.set_output_power_limit(ceiling).await?;
            info!(limit = ceiling, "RF output limited below BPM input tolerance");
        }
    }

    info!(
        rf = %bench.rf.device_id().await?,
        bpm = %bench.bpm.device_id().await?,
        "Test bench ready"
    );
    Ok(bench)
}

async fn build_rf_source(config: &RfSourceConfig) -> Result<Arc<dyn RfSource>> {
    let rf: Arc<dyn RfSource> = match config {
        RfSourceConfig::Simulated { .. } => Arc::new(SimulatedRfSource::new()),
        RfSourceConfig::RigolDsg3030(telnet) => Arc::new(
            Rigol3030RfSource::connect(
                &telnet.host,
                telnet.port_or(rigol_dsg3030::DEFAULT_PORT),
                telnet.timeout(),
                DEFAULT_RF_LIMIT_DBM,
            )
            .await
            .with_context(|| format!("Failed to connect to RF source at {}", telnet.host))?,
        ),
    };
    Ok(rf)
}

async fn build_gate_source(config: &GateSourceConfig) -> Result<Arc<dyn GateSource>> {
    let gate: Arc<dyn GateSource> = match config {
        GateSourceConfig::Simulated => Arc::new(SimulatedGateSource::new()),
        GateSourceConfig::RigolDsg3030(telnet) => Arc::new(
            Rigol3030GateSource::connect(
                &telnet.host,
                telnet.port_or(rigol_dsg3030::DEFAULT_PORT),
                telnet.timeout(),
            )
            .await
            .with_context(|| format!("Failed to connect to gate source at {}", telnet.host))?,
        ),
    };
    Ok(gate)
}

async fn build_attenuator(config: &AttenuatorConfig) -> Result<Arc<dyn Attenuator>> {
    let attenuator: Arc<dyn Attenuator> = match config {
        AttenuatorConfig::Simulated => Arc::new(SimulatedAttenuator::new()),
        AttenuatorConfig::Rc4dat(telnet) => Arc::new(
            Rc4datAttenuator::connect(
                &telnet.host,
                telnet.port_or(rc4dat::DEFAULT_PORT),
                telnet.timeout(),
            )
            .await
            .with_context(|| format!("Failed to connect to attenuator at {}", telnet.host))?,
        ),
    };
    Ok(attenuator)
}

async fn build_bpm(
    config: &BpmConfig,
    rf: Arc<dyn RfSource>,
    gate: Option<Arc<dyn GateSource>>,
    channel_access: Option<Arc<dyn ChannelAccess>>,
) -> Result<Arc<dyn BpmDevice>> {
    let require_ca = || {
        channel_access.clone().ok_or_else(|| {
            HarnessError::Configuration(
                "EPICS BPMs need a channel access client; none was supplied".to_string(),
            )
        })
    };

    let bpm: Arc<dyn BpmDevice> = match config {
        BpmConfig::Simulated => Arc::new(SimulatedBpm::new(rf, gate)),
        BpmConfig::SparkErScpi(spark) => {
            let connection = spark.connection();
            Arc::new(
                SparkErScpiBpm::connect(
                    &connection.host,
                    connection.port_or(spark_er::DEFAULT_PORT),
                    connection.timeout(),
                    spark.auto_trigger,
                )
                .await
                .with_context(|| format!("Failed to connect to Spark BPM at {}", connection.host))?,
            )
        }
        BpmConfig::SparkErEpics { database, daq_type } => {
            Arc::new(SparkErEpicsBpm::connect(require_ca()?, database, daq_type).await?)
        }
        BpmConfig::ElectronEpics { epics_id } => {
            Arc::new(ElectronBpm::connect(require_ca()?, epics_id).await?)
        }
    };
    Ok(bpm)
}
