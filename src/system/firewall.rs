//! DHCP/DNS admission and NAT rule sets for the access point LAN.
//!
//! Enable and disable are built from the same rule descriptors, so whatever
//! an enable call inserted can always be removed by the matching disable.

use std::sync::Arc;

use tracing::{info, warn};

use super::network::Ipv4Cidr;
use super::route::{resolve_wan_interface, RouteSource};
use super::rules::{FirewallRule, RuleManager, Table};
use super::sysctl::IpForwarding;
use crate::error::{ApError, Result};

/// Rules admitting DHCP and DNS traffic from the LAN-facing interface.
pub fn admission_rules(lan_iface: &str) -> Vec<FirewallRule> {
    [("udp", "67"), ("udp", "53"), ("tcp", "53")]
        .iter()
        .map(|&(proto, port)| {
            FirewallRule::new(
                Table::Filter,
                "INPUT",
                &["-i", lan_iface, "-p", proto, "--dport", port],
                "ACCEPT",
            )
        })
        .collect()
}

/// Forwarding and masquerade rules bound to one LAN range and one uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatSession {
    pub lan_cidr: Ipv4Cidr,
    pub lan_iface: String,
    pub wan_iface: String,
}

impl NatSession {
    pub fn new(lan_cidr: Ipv4Cidr, lan_iface: &str, wan_iface: &str) -> Self {
        Self {
            lan_cidr: lan_cidr.network(),
            lan_iface: lan_iface.to_string(),
            wan_iface: wan_iface.to_string(),
        }
    }

    /// The masquerade rule and both forwarding rules.
    ///
    /// Inbound WAN traffic is only forwarded for established or related
    /// connections, and only between this LAN and this uplink.
    pub fn rules(&self) -> Vec<FirewallRule> {
        let cidr = self.lan_cidr.to_string();
        let cidr = cidr.as_str();
        let (lan, wan) = (self.lan_iface.as_str(), self.wan_iface.as_str());
        vec![
            FirewallRule::new(
                Table::Nat,
                "POSTROUTING",
                &["-s", cidr, "-o", wan],
                "MASQUERADE",
            ),
            FirewallRule::new(
                Table::Filter,
                "FORWARD",
                &["-i", lan, "-o", wan, "-s", cidr],
                "ACCEPT",
            ),
            FirewallRule::new(
                Table::Filter,
                "FORWARD",
                &[
                    "-i", wan, "-o", lan, "-d", cidr, "-m", "conntrack", "--ctstate",
                    "RELATED,ESTABLISHED",
                ],
                "ACCEPT",
            ),
        ]
    }
}

/// Applies the access point's firewall state on top of [`RuleManager`].
#[derive(Clone)]
pub struct FirewallPolicy {
    rules: RuleManager,
    forwarding: IpForwarding,
    routes: Arc<dyn RouteSource>,
}

impl FirewallPolicy {
    pub fn new(rules: RuleManager, forwarding: IpForwarding, routes: Arc<dyn RouteSource>) -> Self {
        Self {
            rules,
            forwarding,
            routes,
        }
    }

    /// Admit DHCP (udp/67) and DNS (udp/53, tcp/53) on `lan_iface`.
    ///
    /// On failure, rules inserted by this call are removed again before the
    /// error is returned.
    pub async fn enable_admission(&self, lan_iface: &str) -> Result<()> {
        if lan_iface.is_empty() {
            return Err(ApError::InvalidConfig("LAN interface is required".into()));
        }
        self.ensure_all(&admission_rules(lan_iface)).await?;
        info!("DHCP/DNS admission enabled on {}", lan_iface);
        Ok(())
    }

    /// Remove the admission rules. Each removal is attempted even if an
    /// earlier one fails; the failures are returned.
    pub async fn disable_admission(&self, lan_iface: &str) -> Vec<ApError> {
        self.remove_all(&admission_rules(lan_iface)).await
    }

    /// Build a NAT session, resolving the uplink from the routing table when
    /// no explicit WAN interface is given.
    pub async fn nat_session(
        &self,
        lan_cidr: Ipv4Cidr,
        lan_iface: &str,
        wan_iface: Option<&str>,
    ) -> Result<NatSession> {
        let wan = match wan_iface {
            Some(wan) if !wan.is_empty() => wan.to_string(),
            _ => resolve_wan_interface(self.routes.as_ref()).await?,
        };
        if wan == lan_iface {
            return Err(ApError::InvalidConfig(format!(
                "uplink {} is the access point interface itself",
                wan
            )));
        }
        Ok(NatSession::new(lan_cidr, lan_iface, &wan))
    }

    /// Turn on IPv4 forwarding and ensure the session's NAT rules.
    pub async fn enable_nat(&self, session: &NatSession) -> Result<()> {
        self.forwarding.enable().await?;
        self.ensure_all(&session.rules()).await?;
        info!(
            "NAT enabled: {} via {} -> {}",
            session.lan_cidr, session.lan_iface, session.wan_iface
        );
        Ok(())
    }

    /// Remove the session's NAT rules. IPv4 forwarding is left as it is.
    pub async fn disable_nat(&self, session: &NatSession) -> Vec<ApError> {
        self.remove_all(&session.rules()).await
    }

    async fn ensure_all(&self, rules: &[FirewallRule]) -> Result<()> {
        let mut inserted = Vec::new();
        for rule in rules {
            match self.rules.ensure(rule).await {
                Ok(true) => inserted.push(rule.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!("failed to apply rule {}: {}", rule, e);
                    for applied in inserted.iter().rev() {
                        if let Err(undo) = self.rules.remove_if_present(applied).await {
                            warn!("failed to roll back rule {}: {}", applied, undo);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn remove_all(&self, rules: &[FirewallRule]) -> Vec<ApError> {
        let mut errors = Vec::new();
        for rule in rules {
            if let Err(e) = self.rules.remove_if_present(rule).await {
                warn!("failed to remove rule {}: {}", rule, e);
                errors.push(e);
            }
        }
        errors
    }
}
