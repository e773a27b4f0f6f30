//! Mini-Circuits RC4DAT-6G-95 programmable attenuator
//!
//! Four channels, 0 to 95 dB in 0.25 dB steps, controlled over Telnet. Every
//! command, including the set commands, is answered with two `\r\n`
//! terminated lines which are joined into one reply.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::HarnessError;
use crate::hardware::capabilities::{check_attenuation, Attenuator, Channel};
use crate::hardware::transport::{LineTransport, TelnetTransportBuilder};
use crate::units::{parse_f64, parse_f64_list};

/// Telnet port of the RC4DAT
pub const DEFAULT_PORT: u16 = 23;

const MODEL: &str = "RC4DAT-6G-95";

/// RC4DAT-6G-95 driver
pub struct Rc4datAttenuator {
    transport: Arc<dyn LineTransport>,
    model: String,
}

impl Rc4datAttenuator {
    /// Connect over Telnet, reading two-line replies
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let transport = TelnetTransportBuilder::new(host, port)
            .with_timeout(timeout)
            .with_reply_lines(2)
            .build()
            .await?;
        Self::with_transport(Arc::new(transport)).await
    }

    /// Check the model number over an existing transport
    ///
    /// # Errors
    /// Returns `HarnessError::WrongDevice` if the model is not an RC4DAT-6G-95.
    pub async fn with_transport(transport: Arc<dyn LineTransport>) -> Result<Self> {
        let reply = transport.query("MN?").await?;
        let model = reply.replace("MN=", "").trim().to_string();
        if model != MODEL {
            bail!(HarnessError::WrongDevice {
                expected: MODEL,
                found: model,
            });
        }
        info!(model = %model, address = %transport.address(), "Connected to programmable attenuator");
        Ok(Self { transport, model })
    }
}

#[async_trait]
impl Attenuator for Rc4datAttenuator {
    async fn device_id(&self) -> Result<String> {
        Ok(format!("Programmable Attenuator {}", self.model))
    }

    async fn set_global_attenuation(&self, db: f64) -> Result<[f64; 4]> {
        check_attenuation(db)?;
        self.transport
            .query(&format!(":CHAN:1:2:3:4:SetAtt:{}", db))
            .await?;
        self.global_attenuation().await
    }

    async fn global_attenuation(&self) -> Result<[f64; 4]> {
        let reply = self.transport.query("ATT?").await?;
        let values = parse_f64_list(&reply)?;
        match values.as_slice() {
            [a, b, c, d] => Ok([*a, *b, *c, *d]),
            _ => bail!(HarnessError::parse(reply, "expected four attenuations")),
        }
    }

    async fn set_channel_attenuation(&self, channel: Channel, db: f64) -> Result<f64> {
        check_attenuation(db)?;
        self.transport
            .query(&format!(":CHAN:{}:SetAtt:{}", channel.number(), db))
            .await?;
        self.channel_attenuation(channel).await
    }

    async fn channel_attenuation(&self, channel: Channel) -> Result<f64> {
        let reply = self
            .transport
            .query(&format!(":CHAN:{}:Att?", channel.number()))
            .await?;
        Ok(parse_f64(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLineTransport;

    /// RC4DAT stand-in; set commands answer "1" as the real unit does
    fn rc4dat() -> MockLineTransport {
        let mut channels = [0.0f64; 4];
        MockLineTransport::new().with_handler(move |cmd| {
            if cmd == "MN?" {
                return Some("MN=RC4DAT-6G-95".to_string());
            }
            if cmd == "ATT?" {
                return Some(
                    channels
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(" "),
                );
            }
            let parts: Vec<&str> = cmd.trim_start_matches(":CHAN:").split(':').collect();
            if let Some(pos) = parts.iter().position(|p| *p == "SetAtt") {
                let value: f64 = parts.get(pos + 1)?.parse().ok()?;
                for n in &parts[..pos] {
                    let index: usize = n.parse().ok()?;
                    channels[index - 1] = value;
                }
                return Some("1".to_string());
            }
            if parts.len() == 2 && parts[1] == "Att?" {
                let index: usize = parts[0].parse().ok()?;
                return Some(channels[index - 1].to_string());
            }
            None
        })
    }

    #[tokio::test]
    async fn test_connect_checks_model() {
        let att = Rc4datAttenuator::with_transport(Arc::new(rc4dat())).await.unwrap();
        assert_eq!(
            att.device_id().await.unwrap(),
            "Programmable Attenuator RC4DAT-6G-95"
        );

        let wrong = MockLineTransport::new().with_reply("MN?", "MN=RC4DAT-6G-60");
        let err = Rc4datAttenuator::with_transport(Arc::new(wrong))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("RC4DAT-6G-60"));
    }

    #[tokio::test]
    async fn test_global_and_channel_attenuation() {
        let transport = rc4dat();
        let att = Rc4datAttenuator::with_transport(Arc::new(transport.clone()))
            .await
            .unwrap();

        assert_eq!(att.set_global_attenuation(12.5).await.unwrap(), [12.5; 4]);
        assert!(transport
            .call_log()
            .contains(&":CHAN:1:2:3:4:SetAtt:12.5".to_string()));

        assert_eq!(att.set_channel_attenuation(Channel::B, 30.25).await.unwrap(), 30.25);
        assert!(transport.call_log().contains(&":CHAN:2:SetAtt:30.25".to_string()));
        assert_eq!(att.global_attenuation().await.unwrap(), [12.5, 30.25, 12.5, 12.5]);
    }

    #[tokio::test]
    async fn test_range_checked_before_sending() {
        let transport = rc4dat();
        let att = Rc4datAttenuator::with_transport(Arc::new(transport.clone()))
            .await
            .unwrap();
        transport.clear_log();

        assert!(att.set_channel_attenuation(Channel::A, 100.0).await.is_err());
        assert!(att.set_global_attenuation(-1.0).await.is_err());
        assert!(transport.call_log().is_empty());
    }
}
