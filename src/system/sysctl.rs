//! IPv4 forwarding control via sysctl.

use std::sync::Arc;

use super::command::{args, run_checked, CommandRunner};
use crate::error::{ApError, Result};

const FORWARDING_KEY: &str = "net.ipv4.ip_forward";

/// Kernel IPv4 forwarding toggle.
///
/// Only ever switched on. Other services on the host may rely on forwarding,
/// so nothing here turns it back off.
#[derive(Clone)]
pub struct IpForwarding {
    runner: Arc<dyn CommandRunner>,
}

impl IpForwarding {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Get the current IP forwarding state.
    pub async fn is_enabled(&self) -> Result<bool> {
        let output = run_checked(self.runner.as_ref(), "sysctl", &args(&["-n", FORWARDING_KEY])).await?;
        let value = output.stdout.trim();

        match value {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(ApError::ParseError(format!(
                "Unexpected sysctl value: {}",
                value
            ))),
        }
    }

    pub async fn enable(&self) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            "sysctl",
            &args(&["-w", &format!("{}=1", FORWARDING_KEY)]),
        )
        .await?;
        Ok(())
    }
}
