//! Access point interface acquisition and release.
//!
//! Reset walks the interface toward a known state: no lingering daemons,
//! not managed by NetworkManager, no addresses, radio unblocked, link up.
//! Every step but the last is best-effort.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::command::{args, run_checked, CommandRunner};
use super::network::{read_attr, Ipv4Cidr};
use super::supervisor::ServiceRole;
use crate::error::{ApError, Result};

/// Processes that may still hold the interface from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    AccessPoint,
    Dhcp,
    Supplicant,
}

impl ProcessRole {
    pub fn process_name(self) -> &'static str {
        match self {
            ProcessRole::AccessPoint => "hostapd",
            ProcessRole::Dhcp => "dnsmasq",
            ProcessRole::Supplicant => "wpa_supplicant",
        }
    }

    /// Whether every instance may be killed when none references the interface.
    fn kill_all_fallback(self) -> bool {
        !matches!(self, ProcessRole::Supplicant)
    }
}

impl From<ServiceRole> for ProcessRole {
    fn from(role: ServiceRole) -> Self {
        match role {
            ServiceRole::AccessPoint => ProcessRole::AccessPoint,
            ServiceRole::Dhcp => ProcessRole::Dhcp,
        }
    }
}

/// Best-effort termination of processes by role.
#[async_trait]
pub trait RoleTerminator: Send + Sync {
    /// Kill instances of `role` whose command line mentions `iface_hint`.
    ///
    /// Returns whether anything was signalled.
    async fn terminate_by_role(&self, role: ProcessRole, iface_hint: &str) -> Result<bool>;
}

/// Finds processes with `pgrep -f` and kills them with SIGKILL.
pub struct PgrepTerminator {
    runner: Arc<dyn CommandRunner>,
}

impl PgrepTerminator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RoleTerminator for PgrepTerminator {
    async fn terminate_by_role(&self, role: ProcessRole, iface_hint: &str) -> Result<bool> {
        let name = role.process_name();
        let pattern = format!("{}.*{}", name, iface_hint);
        let output = self.runner.run("pgrep", &args(&["-f", &pattern])).await?;

        let own_pid = std::process::id();
        let pids: Vec<u32> = if output.success() {
            output
                .stdout
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .filter(|pid| *pid != own_pid)
                .collect()
        } else {
            Vec::new()
        };

        if pids.is_empty() {
            if !role.kill_all_fallback() {
                debug!("No {} found for {}", name, iface_hint);
                return Ok(false);
            }
            // Nothing references the interface: fall back to every instance
            let output = self.runner.run("pkill", &args(&["-9", "-x", name])).await?;
            if output.success() {
                info!("Killed all {} processes", name);
            }
            return Ok(output.success());
        }

        let mut failures = Vec::new();
        for pid in &pids {
            info!("Killing {} (PID: {}) for {}", name, pid, iface_hint);
            // A PID may exit between pgrep and kill; keep going either way
            if let Err(e) =
                run_checked(self.runner.as_ref(), "kill", &args(&["-9", &pid.to_string()])).await
            {
                debug!("kill {} failed: {}", pid, e);
                failures.push(pid.to_string());
            }
        }
        if failures.len() == pids.len() {
            return Err(ApError::CommandFailed {
                command: format!("kill -9 {}", failures.join(" ")),
                message: format!("could not kill any {} process", name),
            });
        }
        Ok(true)
    }
}

/// Brings the AP interface to a clean state and hands it back afterwards.
#[derive(Clone)]
pub struct InterfaceController {
    runner: Arc<dyn CommandRunner>,
    roles: Arc<dyn RoleTerminator>,
    sysfs_root: PathBuf,
}

impl InterfaceController {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        roles: Arc<dyn RoleTerminator>,
        sysfs_root: PathBuf,
    ) -> Self {
        Self {
            runner,
            roles,
            sysfs_root,
        }
    }

    /// Perform a complete reset of the wireless interface.
    ///
    /// Only the final link-up is fatal. Failures of earlier steps are logged
    /// and returned as warnings.
    pub async fn reset(&self, ifname: &str) -> Result<Vec<String>> {
        info!("Resetting interface {}...", ifname);
        let mut warnings = Vec::new();

        // Our own services first, then anything still authenticating on the interface
        let services = [ServiceRole::AccessPoint, ServiceRole::Dhcp].map(ProcessRole::from);
        for role in services.into_iter().chain([ProcessRole::Supplicant]) {
            let result = self.roles.terminate_by_role(role, ifname).await.map(|_| ());
            note(&mut warnings, &format!("stop lingering {}", role.process_name()), result);
        }

        note(
            &mut warnings,
            "disable NetworkManager management",
            self.set_managed(ifname, false).await,
        );
        note(&mut warnings, "bring interface down", self.set_link(ifname, false).await);
        note(&mut warnings, "flush IP addresses", self.flush_addresses(ifname).await);
        note(&mut warnings, "unblock rfkill", self.unblock_radio(ifname).await);

        self.set_link(ifname, true).await.map_err(|e| match e {
            ApError::CommandFailed { command, message } => ApError::CommandFailed {
                command,
                message: format!("failed to bring interface up: {}", message),
            },
            other => other,
        })?;

        info!("Interface {} reset complete", ifname);
        Ok(warnings)
    }

    /// Return the interface to NetworkManager.
    pub async fn release(&self, ifname: &str) -> Result<()> {
        self.set_managed(ifname, true).await?;
        info!("Interface {} handed back to NetworkManager", ifname);
        Ok(())
    }

    /// Assign the gateway address to the interface.
    pub async fn assign_address(&self, ifname: &str, address: Ipv4Cidr) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            "ip",
            &args(&["addr", "add", &address.to_string(), "dev", ifname]),
        )
        .await?;
        Ok(())
    }

    /// Tell NetworkManager whether to handle this device.
    pub async fn set_managed(&self, ifname: &str, managed: bool) -> Result<()> {
        let state = if managed { "yes" } else { "no" };
        run_checked(
            self.runner.as_ref(),
            "nmcli",
            &args(&["device", "set", ifname, "managed", state]),
        )
        .await?;
        Ok(())
    }

    async fn set_link(&self, ifname: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        run_checked(
            self.runner.as_ref(),
            "ip",
            &args(&["link", "set", ifname, state]),
        )
        .await?;
        Ok(())
    }

    async fn flush_addresses(&self, ifname: &str) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            "ip",
            &args(&["addr", "flush", "dev", ifname]),
        )
        .await?;
        Ok(())
    }

    /// Unblock all Wi-Fi radios, then this interface's radio specifically.
    async fn unblock_radio(&self, ifname: &str) -> Result<()> {
        let global = run_checked(self.runner.as_ref(), "rfkill", &args(&["unblock", "wifi"])).await;

        let Some(index) = self.radio_index(ifname) else {
            // The global unblock is all we can do
            debug!("No rfkill index for {}", ifname);
            return global.map(|_| ());
        };
        if let Err(e) = global {
            warn!("  rfkill unblock wifi warning: {}", e);
        }

        run_checked(self.runner.as_ref(), "rfkill", &args(&["unblock", &index])).await?;
        Ok(())
    }

    /// rfkill index of the interface's physical radio, from sysfs.
    fn radio_index(&self, ifname: &str) -> Option<String> {
        let phy_dir = self.sysfs_root.join("class/net").join(ifname).join("phy80211");

        if let Ok(entries) = fs::read_dir(&phy_dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with("rfkill") {
                    if let Some(index) = read_attr(&entry.path().join("index")) {
                        return Some(index);
                    }
                }
            }
        }

        // Fall back to the phy number, e.g. "phy0" -> "0"
        let phy = read_attr(&phy_dir.join("name"))?;
        phy.strip_prefix("phy")
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
    }
}

fn note(warnings: &mut Vec<String>, step: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("  Warning: could not {}: {}", step, e);
        warnings.push(format!("could not {}: {}", step, e));
    }
}
