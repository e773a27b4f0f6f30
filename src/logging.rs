//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be made more verbose without editing the configuration file.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Build the filter: `RUST_LOG` if set, otherwise `level` for this crate and
/// `warn` for everything else.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,bpm_harness={}", level)))
}

/// Install the global subscriber, human readable or JSON lines.
pub fn init(level: &str, json: bool) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false);

    let installed = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Install the subscriber at the configured level.
pub fn init_from_config(application: &ApplicationConfig, json: bool) -> Result<()> {
    init(&application.log_level, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_env_filter_uses_level_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter("debug");
        assert_eq!(
            filter.max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::DEBUG)
        );
    }
}
