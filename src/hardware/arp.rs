//! MAC address lookup for BPM identification.
//!
//! The Libera units are identified in reports by their MAC address, which is
//! read from the host's ARP cache with `arp -n <ip>`.

use tokio::process::Command;
use tracing::warn;

/// Placeholder used when the ARP cache has no entry.
pub const UNKNOWN_MAC: &str = "unknown";

/// Extract the MAC address from `arp -n` output.
///
/// The first line is the column header; the MAC is the 17 characters that
/// start two before the first `:` of the second line.
pub fn parse_arp_output(output: &str) -> Option<String> {
    let entry = output.lines().nth(1)?;
    let colon = entry.find(':')?;
    let start = colon.checked_sub(2)?;
    entry.get(start..start + 17).map(str::to_string)
}

/// Resolve the MAC address of `ip`, or [`UNKNOWN_MAC`] if it cannot be found.
pub async fn lookup_mac(ip: &str) -> String {
    match Command::new("arp").arg("-n").arg(ip).output().await {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout);
            parse_arp_output(&text).unwrap_or_else(|| {
                warn!(ip, "no ARP entry for BPM host");
                UNKNOWN_MAC.to_string()
            })
        }
        Err(e) => {
            warn!(ip, error = %e, "arp lookup failed");
            UNKNOWN_MAC.to_string()
        }
    }
}
