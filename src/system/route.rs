//! Uplink (WAN) interface discovery from the IPv4 routing table.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::command::{args, run_checked, CommandRunner};
use crate::error::{ApError, Result};

/// One entry of `ip -j route` output. Only the fields the resolver needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouteEntry {
    /// Destination prefix; `"default"`, `"0.0.0.0/0"` or absent for a default route.
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub dev: Option<String>,
    /// Route priority. 0 means unspecified, not best.
    #[serde(default)]
    pub metric: u32,
    /// Only present when the dump spans more than one table.
    #[serde(default)]
    pub table: Option<String>,
}

impl RouteEntry {
    pub fn is_default(&self) -> bool {
        match self.dst.as_deref() {
            None | Some("") | Some("default") | Some("0.0.0.0/0") => true,
            Some(_) => false,
        }
    }

    fn in_main_table(&self) -> bool {
        self.table.as_deref().map_or(true, |t| t == "main")
    }
}

/// Source of the live IPv4 routing table. Re-read on every call.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn ipv4_routes(&self) -> Result<Vec<RouteEntry>>;
}

/// Reads routes with iproute2's JSON output.
pub struct IpRouteSource {
    runner: Arc<dyn CommandRunner>,
}

impl IpRouteSource {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RouteSource for IpRouteSource {
    async fn ipv4_routes(&self) -> Result<Vec<RouteEntry>> {
        let output = run_checked(
            self.runner.as_ref(),
            "ip",
            &args(&["-4", "-j", "route", "show", "table", "main"]),
        )
        .await?;
        parse_routes(&output.stdout)
    }
}

/// Parse `ip -j route` output.
pub fn parse_routes(json: &str) -> Result<Vec<RouteEntry>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|e| ApError::ParseError(format!("ip route JSON: {}", e)))
}

/// Pick the winning default route from the main table.
///
/// Lowest non-zero metric wins; a metric of 0 only wins when nothing else
/// has a metric. Ties go to the first route seen.
pub fn select_default_route(routes: &[RouteEntry]) -> Option<&RouteEntry> {
    let mut best: Option<&RouteEntry> = None;

    for route in routes {
        if !route.is_default() || !route.in_main_table() || route.dev.is_none() {
            continue;
        }
        best = match best {
            None => Some(route),
            Some(current) if ranks_before(route.metric, current.metric) => Some(route),
            Some(current) => Some(current),
        };
    }

    best
}

/// Whether `candidate` strictly outranks `current`.
fn ranks_before(candidate: u32, current: u32) -> bool {
    match (candidate, current) {
        (0, _) => false,
        (_, 0) => true,
        (c, cur) => c < cur,
    }
}

/// Name of the interface carrying the current default route.
pub async fn resolve_wan_interface(source: &dyn RouteSource) -> Result<String> {
    let routes = source.ipv4_routes().await?;
    select_default_route(&routes)
        .and_then(|route| route.dev.clone())
        .ok_or(ApError::NoDefaultRoute)
}
