//! In-memory transports for exercising drivers without instruments.
//!
//! - `MockLineTransport` answers commands from a reply table or a handler
//!   closure, queues the replies for `read_line`, and records every command
//!   it was sent
//! - `MockChannelAccess` holds a PV table and records every put
//!
//! Both support failure injection for error-path tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::HarnessError;
use crate::hardware::channel_access::ChannelAccess;
use crate::hardware::transport::LineTransport;

type Handler = Box<dyn FnMut(&str) -> Option<String> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted line transport
///
/// # Example
///
/// ```
/// use bpm_harness::hardware::mock::MockLineTransport;
/// use bpm_harness::hardware::transport::LineTransport;
///
/// # async fn example() -> anyhow::Result<()> {
/// let transport = MockLineTransport::new().with_reply("MN?", "MN=RC4DAT-6G-95");
/// assert_eq!(transport.query("MN?").await?, "MN=RC4DAT-6G-95");
/// assert_eq!(transport.call_log(), vec!["MN?".to_string()]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MockLineTransport {
    address: String,
    replies: Arc<Mutex<HashMap<String, String>>>,
    handler: Arc<Mutex<Option<Handler>>>,
    pending: Arc<Mutex<VecDeque<String>>>,
    should_fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
}

impl Default for MockLineTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLineTransport {
    /// Create a transport with no replies configured
    pub fn new() -> Self {
        Self {
            address: "mock:0".to_string(),
            replies: Arc::new(Mutex::new(HashMap::new())),
            handler: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the address reported to drivers
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Fixed reply to a query
    pub fn with_reply(self, command: impl Into<String>, reply: impl Into<String>) -> Self {
        self.set_reply(command, reply);
        self
    }

    /// Route every command through a closure
    ///
    /// The closure sees writes as well as queries, so it can keep instrument
    /// state. A `Some` return is queued as the instrument's reply, so set
    /// commands should return `None`. Commands it answers with `None` fall
    /// back to the reply table.
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        *lock(&self.handler) = Some(Box::new(handler));
        self
    }

    /// Replace or add a fixed reply
    pub fn set_reply(&self, command: impl Into<String>, reply: impl Into<String>) {
        lock(&self.replies).insert(command.into(), reply.into());
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every command sent so far, in order
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn record(&self, command: &str) -> Result<Option<String>> {
        lock(&self.call_log).push(command.to_string());

        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!(HarnessError::Transport("Injected failure".to_string()));
        }

        let handled = lock(&self.handler)
            .as_mut()
            .and_then(|handler| handler(command));
        Ok(handled.or_else(|| lock(&self.replies).get(command).cloned()))
    }
}

#[async_trait]
impl LineTransport for MockLineTransport {
    async fn write(&self, command: &str) -> Result<()> {
        if let Some(reply) = self.record(command)? {
            lock(&self.pending).push_back(reply);
        }
        Ok(())
    }

    async fn read_line(&self) -> Result<String> {
        match lock(&self.pending).pop_front() {
            Some(reply) => Ok(reply),
            None => bail!(HarnessError::Timeout {
                command: "read".to_string(),
                timeout_ms: 0,
            }),
        }
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

/// In-memory process variable table
#[derive(Clone)]
pub struct MockChannelAccess {
    pvs: Arc<Mutex<HashMap<String, Vec<f64>>>>,
    hosts: Arc<Mutex<HashMap<String, String>>>,
    default_host: String,
    should_fail_next: Arc<AtomicBool>,
    put_log: Arc<Mutex<Vec<(String, f64)>>>,
}

impl Default for MockChannelAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannelAccess {
    /// Empty PV table served from 127.0.0.1
    pub fn new() -> Self {
        Self {
            pvs: Arc::new(Mutex::new(HashMap::new())),
            hosts: Arc::new(Mutex::new(HashMap::new())),
            default_host: "127.0.0.1".to_string(),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            put_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a scalar PV
    pub fn with_pv(self, pv: impl Into<String>, value: f64) -> Self {
        self.set_waveform(pv, vec![value]);
        self
    }

    /// Add a waveform PV
    pub fn with_waveform(self, pv: impl Into<String>, values: Vec<f64>) -> Self {
        self.set_waveform(pv, values);
        self
    }

    /// Report `host` as the IOC serving `pv`
    pub fn with_host(self, pv: impl Into<String>, host: impl Into<String>) -> Self {
        lock(&self.hosts).insert(pv.into(), host.into());
        self
    }

    /// Replace a PV's contents
    pub fn set_waveform(&self, pv: impl Into<String>, values: Vec<f64>) {
        lock(&self.pvs).insert(pv.into(), values);
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every put so far, in order
    pub fn put_log(&self) -> Vec<(String, f64)> {
        lock(&self.put_log).clone()
    }

    fn check_failure(&self, pv: &str) -> Result<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!(HarnessError::ChannelAccess {
                pv: pv.to_string(),
                reason: "Injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelAccess for MockChannelAccess {
    async fn get(&self, pv: &str) -> Result<Vec<f64>> {
        self.check_failure(pv)?;
        match lock(&self.pvs).get(pv) {
            Some(values) => Ok(values.clone()),
            None => bail!(HarnessError::ChannelAccess {
                pv: pv.to_string(),
                reason: "no such PV".to_string(),
            }),
        }
    }

    async fn put(&self, pv: &str, value: f64) -> Result<()> {
        self.check_failure(pv)?;
        lock(&self.put_log).push((pv.to_string(), value));
        lock(&self.pvs).insert(pv.to_string(), vec![value]);
        Ok(())
    }

    async fn host(&self, pv: &str) -> Result<String> {
        Ok(lock(&self.hosts)
            .get(pv)
            .cloned()
            .unwrap_or_else(|| self.default_host.clone()))
    }
}
