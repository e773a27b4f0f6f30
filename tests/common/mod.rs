//! Common test utilities for bpm_harness integration tests
//!
//! - A simulated bench with every device present
//! - A TCP stand-in for a Rigol DSG3030 so drivers run over a real socket

#![allow(dead_code)] // Not every test binary uses every helper

use std::collections::HashMap;
use std::sync::Arc;

use bpm_harness::hardware::{
    RfSource, SimulatedAttenuator, SimulatedBpm, SimulatedGateSource, SimulatedRfSource,
};
use bpm_harness::TestBench;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Bench of simulated devices whose BPM follows the RF and gate sources
pub fn simulated_bench() -> TestBench {
    let rf: Arc<dyn RfSource> = Arc::new(SimulatedRfSource::new());
    let gate = Arc::new(SimulatedGateSource::new());
    let bpm = Arc::new(SimulatedBpm::new(rf.clone(), Some(gate.clone())));
    TestBench::new(rf, bpm)
        .with_gate(gate)
        .with_attenuator(Arc::new(SimulatedAttenuator::new()))
}

/// Answer one SCPI line the way a DSG3030 does
fn dsg3030_reply(settings: &mut HashMap<String, String>, line: &str) -> Option<String> {
    match line {
        "*IDN?" => return Some("Rigol Technologies,DSG3030,DSG3A000000001,00.01.05".to_string()),
        "UNIT:POW?" => return Some("dBm".to_string()),
        _ => {}
    }
    if let Some(key) = line.strip_suffix('?') {
        return Some(settings.get(key).cloned().unwrap_or_else(|| "0".to_string()));
    }
    if let Some((key, value)) = line.split_once(' ') {
        let value = match value {
            "ON" => "1",
            "OFF" => "0",
            other => other,
        };
        settings.insert(key.to_string(), value.to_string());
    }
    None
}

/// Start a DSG3030 stand-in on a local port
///
/// Every connection gets its own settings, like the separate RF and gate
/// sessions against the same instrument.
pub async fn spawn_dsg3030() -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut settings: HashMap<String, String> = HashMap::from([
                    ("FREQ".to_string(), "0MHz".to_string()),
                    ("PULM:PER".to_string(), "10us".to_string()),
                    ("PULM:WIDT".to_string(), "0us".to_string()),
                ]);
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim_end_matches('\r');
                    if let Some(reply) = dsg3030_reply(&mut settings, line) {
                        if write.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    ("127.0.0.1".to_string(), port)
}
