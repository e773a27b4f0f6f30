//! Process-variable access for EPICS-hosted BPMs.
//!
//! The harness does not implement the channel access protocol. Drivers talk
//! to a `ChannelAccess` implementation provided by the caller, which may wrap
//! a CA client library, a gateway, or the in-memory
//! [`MockChannelAccess`](crate::hardware::mock::MockChannelAccess).

use anyhow::Result;
use async_trait::async_trait;

/// Read/write access to named process variables.
#[async_trait]
pub trait ChannelAccess: Send + Sync {
    /// Read a PV. Scalar PVs come back as a one element vector, waveforms in
    /// full.
    async fn get(&self, pv: &str) -> Result<Vec<f64>>;

    /// Write a scalar value to a PV
    async fn put(&self, pv: &str, value: f64) -> Result<()>;

    /// IP address of the IOC serving the PV
    async fn host(&self, pv: &str) -> Result<String>;
}
