//! Line-oriented Telnet/SCPI transport.
//!
//! Every real instrument except the EPICS BPMs is driven the same way: open a
//! TCP connection, write an ASCII command followed by `\r\n`, and for queries
//! read back a terminated line. No Telnet option negotiation takes place; the
//! instruments expose raw socket servers.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use bpm_harness::hardware::transport::{LineTransport, TelnetTransportBuilder};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let rigol = TelnetTransportBuilder::new("172.23.252.51", 5555)
//!     .with_timeout(Duration::from_secs(1))
//!     .build()
//!     .await?;
//! println!("{}", rigol.query("*IDN?").await?);
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::HarnessError;

/// Request/reply channel to a line-protocol instrument.
#[async_trait]
pub trait LineTransport: Send + Sync {
    /// Send a command that produces no reply
    async fn write(&self, command: &str) -> Result<()>;

    /// Read the next reply, terminators stripped
    async fn read_line(&self) -> Result<String>;

    /// Send a command and read its reply
    async fn query(&self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read_line().await
    }

    /// Where the transport is connected, for logs and device IDs
    fn address(&self) -> String;
}

/// Builder for [`TelnetTransport`].
///
/// Defaults match the Rigol and Libera instruments: one second timeout,
/// `\r\n` written after each command, replies terminated by `\n`.
pub struct TelnetTransportBuilder {
    host: String,
    port: u16,
    timeout: Duration,
    write_terminator: String,
    read_delimiter: u8,
    reply_lines: usize,
}

impl TelnetTransportBuilder {
    /// Create a new builder for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(1),
            write_terminator: "\r\n".to_string(),
            read_delimiter: b'\n',
            reply_lines: 1,
        }
    }

    /// Set timeout for connecting and for each reply line
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the characters appended to every command
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Set the byte that ends a reply line
    pub fn with_read_delimiter(mut self, delimiter: u8) -> Self {
        self.read_delimiter = delimiter;
        self
    }

    /// Number of lines that make up one reply
    ///
    /// The Mini-Circuits attenuators answer every query with two lines.
    pub fn with_reply_lines(mut self, lines: usize) -> Self {
        self.reply_lines = lines.max(1);
        self
    }

    /// Connect and build the transport
    ///
    /// # Errors
    /// Returns `HarnessError::Timeout` if the connection is not established
    /// within the timeout, or the underlying socket error.
    pub async fn build(self) -> Result<TelnetTransport> {
        let address = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| HarnessError::Timeout {
                command: format!("connect {}", address),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .with_context(|| format!("Failed to connect to {}", address))?;
        stream.set_nodelay(true).ok();
        debug!(%address, "telnet connection opened");

        Ok(TelnetTransport {
            inner: Arc::new(Mutex::new(BufStream::new(stream))),
            out_of_step: AtomicBool::new(false),
            address,
            timeout: self.timeout,
            write_terminator: self.write_terminator,
            read_delimiter: self.read_delimiter,
            reply_lines: self.reply_lines,
        })
    }
}

/// TCP line transport shared behind an async mutex.
///
/// A query holds the lock across its write and read so replies can never be
/// paired with the wrong command. A reply that times out may still arrive
/// later, so after any timeout the transport refuses further traffic with
/// `HarnessError::Transport` until a new connection is made.
pub struct TelnetTransport {
    inner: Arc<Mutex<BufStream<TcpStream>>>,
    out_of_step: AtomicBool,
    address: String,
    timeout: Duration,
    write_terminator: String,
    read_delimiter: u8,
    reply_lines: usize,
}

impl TelnetTransport {
    /// Connect with default settings
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        TelnetTransportBuilder::new(host, port)
            .with_timeout(timeout)
            .build()
            .await
    }

    /// Get configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn ensure_in_step(&self) -> Result<()> {
        if self.out_of_step.load(Ordering::SeqCst) {
            bail!(HarnessError::Transport(format!(
                "Connection to {} is out of step after a reply timeout; reconnect",
                self.address
            )));
        }
        Ok(())
    }

    async fn send(&self, stream: &mut BufStream<TcpStream>, command: &str) -> Result<()> {
        let payload = format!("{}{}", command, self.write_terminator);
        stream
            .write_all(payload.as_bytes())
            .await
            .with_context(|| format!("Write to {} failed: {}", self.address, command))?;
        stream.flush().await.context("Telnet flush failed")?;
        Ok(())
    }

    async fn receive(&self, stream: &mut BufStream<TcpStream>, command: &str) -> Result<String> {
        let mut reply = String::new();
        for _ in 0..self.reply_lines {
            let mut buf = Vec::new();
            let n = tokio::time::timeout(
                self.timeout,
                stream.read_until(self.read_delimiter, &mut buf),
            )
            .await
            .map_err(|_| {
                self.out_of_step.store(true, Ordering::SeqCst);
                HarnessError::Timeout {
                    command: command.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            })?
            .with_context(|| format!("Read from {} failed", self.address))?;

            if n == 0 {
                bail!(HarnessError::Transport(format!(
                    "Connection to {} closed while waiting for reply to '{}'",
                    self.address, command
                )));
            }

            let line = String::from_utf8_lossy(&buf);
            reply.push_str(line.trim_end_matches(['\r', '\n']));
        }
        Ok(reply)
    }
}

#[async_trait]
impl LineTransport for TelnetTransport {
    async fn write(&self, command: &str) -> Result<()> {
        debug!(address = %self.address, command, "telnet write");
        let mut stream = self.inner.lock().await;
        self.ensure_in_step()?;
        self.send(&mut stream, command).await
    }

    async fn read_line(&self) -> Result<String> {
        let mut stream = self.inner.lock().await;
        self.ensure_in_step()?;
        self.receive(&mut stream, "read").await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut stream = self.inner.lock().await;
        self.ensure_in_step()?;
        self.send(&mut stream, command).await?;
        let reply = self.receive(&mut stream, command).await?;
        debug!(address = %self.address, command, reply = %reply, "telnet query");
        Ok(reply)
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal instrument answering `*IDN?` and echoing other queries
    async fn spawn_echo_server(reply_suffix: &'static str) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end_matches('\r').to_string();
                if line == "*IDN?" {
                    write
                        .write_all(format!("Rigol Technologies,DSG3030{}", reply_suffix).as_bytes())
                        .await
                        .unwrap();
                } else if line.ends_with('?') {
                    write
                        .write_all(format!("{}{}", line, reply_suffix).as_bytes())
                        .await
                        .unwrap();
                }
            }
        });
        ("127.0.0.1".to_string(), port)
    }

    #[tokio::test]
    async fn test_query_strips_terminators() {
        let (host, port) = spawn_echo_server("\r\n").await;
        let transport = TelnetTransport::connect(&host, port, Duration::from_secs(1))
            .await
            .unwrap();

        let idn = transport.query("*IDN?").await.unwrap();
        assert_eq!(idn, "Rigol Technologies,DSG3030");
        assert_eq!(transport.address(), format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_write_then_query_stay_in_order() {
        let (host, port) = spawn_echo_server("\n").await;
        let transport = TelnetTransport::connect(&host, port, Duration::from_secs(1))
            .await
            .unwrap();

        transport.write("OUTP ON").await.unwrap();
        assert_eq!(transport.query("OUTP?").await.unwrap(), "OUTP?");
    }

    #[tokio::test]
    async fn test_missing_reply_times_out() {
        let (host, port) = spawn_echo_server("\n").await;
        let transport = TelnetTransportBuilder::new(host, port)
            .with_timeout(Duration::from_millis(100))
            .build()
            .await
            .unwrap();

        // Commands without '?' get no reply from the test server
        let err = transport.query("OUTP ON").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_line_after_write() {
        let (host, port) = spawn_echo_server("\r\n").await;
        let transport = TelnetTransport::connect(&host, port, Duration::from_secs(1))
            .await
            .unwrap();

        transport.write("LEV?").await.unwrap();
        assert_eq!(transport.read_line().await.unwrap(), "LEV?");
    }

    #[tokio::test]
    async fn test_late_reply_never_answers_next_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.trim_end_matches('\r') {
                    "LEV?" => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        write.write_all(b"-40\n").await.unwrap();
                    }
                    "OUTP?" => write.write_all(b"1\n").await.unwrap(),
                    _ => {}
                }
            }
        });
        let transport = TelnetTransportBuilder::new("127.0.0.1", port)
            .with_timeout(Duration::from_millis(100))
            .build()
            .await
            .unwrap();

        let err = transport.query("LEV?").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Timeout { .. })
        ));

        // Give the slow reply time to land in the socket
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = transport.query("OUTP?").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Transport(_))
        ));
        assert!(transport.write("OUTP OFF").await.is_err());
        assert!(transport.read_line().await.is_err());
    }
}
