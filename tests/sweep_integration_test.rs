//! Sweeps run end to end on simulated benches and over TCP
//!
//! Settling delays run on paused tokio time, so they cost nothing but are
//! still observable through `tokio::time::Instant`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bpm_harness::hardware::{
    GateSource, Rigol3030GateSource, Rigol3030RfSource, RfSource, SimulatedBpm,
};
use bpm_harness::report::TestStatus;
use bpm_harness::sweeps::{
    beam_power_dependence, fixed_amplitude_fill_pattern, FillPatternParams, GridRasterParams,
    PermutationParams, PowerDependenceParams, ScaledFillPatternParams,
};
use bpm_harness::{run_sweeps, SweepDefinition, TestReport};
use tracing_test::traced_test;

fn all_sweeps() -> Vec<SweepDefinition> {
    vec![
        SweepDefinition::PowerDependence(PowerDependenceParams {
            start_power: -70.0,
            end_power: -60.0,
            samples: 30,
            ..Default::default()
        }),
        SweepDefinition::FixedAmplitudeFillPattern(FillPatternParams {
            power: -60.0,
            ..Default::default()
        }),
        SweepDefinition::ScaledAmplitudeFillPattern(ScaledFillPatternParams {
            desired_power: -60.0,
            ..Default::default()
        }),
        SweepDefinition::AttenuationPermutation(PermutationParams::default()),
        SweepDefinition::GridRaster(GridRasterParams::default()),
        SweepDefinition::GridRaster(GridRasterParams {
            quantised: false,
            x_points: 4,
            y_points: 4,
            ..Default::default()
        }),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_all_sweeps_pass_on_simulated_bench() {
    let bench = common::simulated_bench();
    bench.protect_bpm().await.unwrap();
    let mut report = TestReport::new("BPM Test Report", "Diagnostics Group");

    run_sweeps(&bench, &all_sweeps(), Duration::from_secs(3), &mut report).await;

    assert_eq!(report.sections.len(), 6);
    for section in &report.sections {
        assert_eq!(section.status, TestStatus::Passed, "{} failed", section.name);
        assert_eq!(section.tables.len(), 1);
    }
    assert_eq!(report.sections[0].tables[0].row_count(), 30);
    // 3 attenuation values on 4 channels
    assert_eq!(report.sections[3].tables[0].row_count(), 81);
    assert_eq!(report.sections[4].tables[0].row_count(), 100);
    assert_eq!(
        report.sections[5].name,
        "Beam position linear raster scan test"
    );

    assert!(!bench.rf.output_state().await.unwrap());
    assert!(!bench.gate.as_ref().unwrap().modulation_state().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_settling_time_between_steps() {
    let bench = common::simulated_bench();
    let params = PowerDependenceParams {
        start_power: -70.0,
        end_power: -60.0,
        samples: 5,
        ..Default::default()
    };

    let start = tokio::time::Instant::now();
    beam_power_dependence(bench.rf.as_ref(), bench.bpm.as_ref(), &params, Duration::from_secs(2))
        .await
        .unwrap();

    // One settle after switching on, then one per step
    assert_eq!(start.elapsed(), Duration::from_secs(12));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_settling_override() {
    let bench = common::simulated_bench();
    let sweeps = vec![SweepDefinition::PowerDependence(PowerDependenceParams {
        samples: 2,
        settling_time_s: Some(0.5),
        ..Default::default()
    })];
    let mut report = TestReport::new("BPM Test Report", "Diagnostics Group");

    let start = tokio::time::Instant::now();
    run_sweeps(&bench, &sweeps, Duration::from_secs(10), &mut report).await;

    assert_eq!(start.elapsed(), Duration::from_millis(1500));
    assert!(report.sections[0]
        .parameters
        .contains(&"Settling time: 0.5s".to_string()));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_sweeps_log_their_start() {
    let bench = common::simulated_bench();
    let sweeps = vec![SweepDefinition::PowerDependence(PowerDependenceParams {
        samples: 2,
        ..Default::default()
    })];
    let mut report = TestReport::new("BPM Test Report", "Diagnostics Group");

    run_sweeps(&bench, &sweeps, Duration::ZERO, &mut report).await;

    assert!(logs_contain("Starting test \"Beam Power Dependence\""));
    // -100 dBm to 0 dBm against the -40 dBm simulated limit
    assert!(logs_contain("Power limit has been reached"));
}

#[tokio::test]
async fn test_power_dependence_over_tcp() {
    let (host, port) = common::spawn_dsg3030().await;
    let rf: Arc<dyn RfSource> = Arc::new(
        Rigol3030RfSource::connect(&host, port, Duration::from_secs(1), -40.0)
            .await
            .unwrap(),
    );
    let bpm = SimulatedBpm::new(rf.clone(), None);
    let params = PowerDependenceParams {
        start_power: -70.0,
        end_power: -50.0,
        samples: 3,
        ..Default::default()
    };

    let (result, section) = beam_power_dependence(rf.as_ref(), &bpm, &params, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(result.output_power, vec![-70.0, -60.0, -50.0]);
    assert_eq!(result.input_power, vec![-82.0, -72.0, -62.0]);
    assert!(section.device_names[0].starts_with("RF Source Rigol Technologies,DSG3030"));
    assert!(section
        .parameters
        .contains(&"Frequency: 499.6817682MHz".to_string()));
    assert!(!rf.output_state().await.unwrap());
}

#[tokio::test]
async fn test_fill_pattern_over_tcp() {
    let (host, port) = common::spawn_dsg3030().await;
    let rf: Arc<dyn RfSource> = Arc::new(
        Rigol3030RfSource::connect(&host, port, Duration::from_secs(1), -40.0)
            .await
            .unwrap(),
    );
    let gate: Arc<dyn GateSource> = Arc::new(
        Rigol3030GateSource::connect(&host, port, Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let bpm = SimulatedBpm::new(rf.clone(), Some(gate.clone()));
    let params = FillPatternParams {
        power: -50.0,
        samples: 4,
        pulse_period: 2.0,
        ..Default::default()
    };

    let (result, section) =
        fixed_amplitude_fill_pattern(rf.as_ref(), &bpm, gate.as_ref(), &params, Duration::ZERO)
            .await
            .unwrap();

    let expected = [0.1, 0.4, 0.7, 1.0];
    for (measured, expected) in result.dutycycle.iter().zip(expected) {
        assert!((measured - expected).abs() < 1e-9);
    }
    assert!(section
        .parameters
        .contains(&"Pulse Period: 2us".to_string()));
    assert!(!gate.modulation_state().await.unwrap());
    assert!(!rf.output_state().await.unwrap());
}
