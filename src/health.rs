//! Access point health monitoring.
//!
//! Periodic checks while the AP is running: interface link still up, IP
//! forwarding still enabled. Results are reported, never acted on.

use std::sync::Arc;

use crate::system::command::{args, CommandRunner};
use crate::system::IpForwarding;

/// Overall health of the running access point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Something is degraded but clients may still get through.
    Degraded(String),
    /// The AP interface is down: no client traffic.
    Down(String),
}

/// Run health checks against the running access point.
///
/// Checks (in order of severity):
/// 1. AP interface is still UP
/// 2. IP forwarding is still enabled
pub async fn check_health(runner: &Arc<dyn CommandRunner>, iface: &str) -> HealthStatus {
    if !is_interface_up(runner.as_ref(), iface).await {
        return HealthStatus::Down(format!("AP interface {} is no longer up", iface));
    }

    match IpForwarding::new(runner.clone()).is_enabled().await {
        Ok(false) => HealthStatus::Degraded("IP forwarding was disabled externally".to_string()),
        // Can't check: assume OK rather than false-alarm
        Ok(true) | Err(_) => HealthStatus::Healthy,
    }
}

/// Whether the interface has the UP flag.
async fn is_interface_up(runner: &dyn CommandRunner, iface: &str) -> bool {
    let Ok(output) = runner.run("ip", &args(&["-o", "link", "show", "dev", iface])).await else {
        return true;
    };
    if !output.success() {
        // Interface doesn't exist anymore
        return false;
    }
    has_up_flag(&output.stdout)
}

/// The flags look like: `3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ...`
fn has_up_flag(line: &str) -> bool {
    let Some((_, rest)) = line.split_once('<') else {
        return false;
    };
    let flags = rest.split_once('>').map_or(rest, |(flags, _)| flags);
    flags.split(',').any(|flag| flag == "UP")
}
