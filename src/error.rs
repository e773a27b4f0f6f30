//! Custom error types for the harness.
//!
//! This module defines `HarnessError`, the typed failure raised by device
//! drivers and sweeps. Device traits return `anyhow::Result`, so a
//! `HarnessError` usually travels inside an `anyhow::Error`; callers that need
//! to react to a specific failure can recover it with `downcast_ref`.
//!
//! ## Error Hierarchy
//!
//! - **`OutOfRange`**: a set-point outside what the device accepts (negative
//!   frequency, duty cycle above 1, attenuation above 95 dB). Raised before any
//!   command reaches the hardware.
//! - **`InvalidChannel`**: an attenuator channel name or index that does not
//!   map onto A, B, C or D.
//! - **`WrongDevice`**: the identification reply does not match the driver.
//! - **`Parse`**: a reply that could not be turned into a number.
//! - **`Timeout`** and **`Transport`**: line-protocol failures.
//! - **`ChannelAccess`**: a process variable could not be read or written.
//! - **`Configuration`**: semantic configuration errors found at validation.
//! - **`Io`**: wraps `std::io::Error` for report output and sockets.
//! - **`Report`**: failures while exporting report tables.

use thiserror::Error;

/// Convenience alias for results using the harness error type.
pub type AppResult<T> = std::result::Result<T, HarnessError>;

/// Errors raised by the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A numeric argument outside the range the device accepts.
    #[error("{quantity} {value} is out of range ({allowed})")]
    OutOfRange {
        /// Name of the quantity being set
        quantity: &'static str,
        /// Rejected value
        value: f64,
        /// Human readable description of the accepted range
        allowed: &'static str,
    },

    /// Attenuator channel that is not A-D or 1-4.
    #[error("Invalid attenuator channel '{0}'. Must be A-D or 1-4")]
    InvalidChannel(String),

    /// Identification reply did not match the expected instrument.
    #[error("Wrong hardware device connected: expected {expected}, got '{found}'")]
    WrongDevice {
        /// Model the driver talks to
        expected: &'static str,
        /// What the instrument reported
        found: String,
    },

    /// Reply could not be parsed.
    #[error("Could not parse reply '{reply}': {reason}")]
    Parse {
        /// Raw reply text
        reply: String,
        /// What went wrong
        reason: String,
    },

    /// No reply within the transport timeout.
    #[error("Timed out after {timeout_ms}ms waiting for reply to '{command}'")]
    Timeout {
        /// Command that was waiting for a reply
        command: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Connection closed or unusable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Channel access request failed.
    #[error("Channel access error on '{pv}': {reason}")]
    ChannelAccess {
        /// Process variable name
        pv: String,
        /// What went wrong
        reason: String,
    },

    /// Semantic configuration problem.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Report export failure.
    #[error("Report error: {0}")]
    Report(String),
}

impl HarnessError {
    /// Build a parse error from a reply and a reason.
    pub fn parse(reply: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::Parse {
            reply: reply.into(),
            reason: reason.to_string(),
        }
    }
}
