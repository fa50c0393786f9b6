//! Wireless interface detection and IPv4 address ranges.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ApError, Result};

/// Information about a wireless network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: Option<u32>,
    /// Physical radio name, e.g. "phy0".
    pub phy: Option<String>,
    pub mac: Option<String>,
}

/// Detect wireless interfaces under `<sysfs_root>/class/net`.
///
/// An interface is wireless when it exposes a `phy80211` link or a
/// `wireless` directory. Results are sorted by name.
pub fn detect_wireless_interfaces(sysfs_root: &Path) -> Result<Vec<InterfaceInfo>> {
    let net_dir = sysfs_root.join("class/net");
    let mut interfaces = Vec::new();

    for entry in fs::read_dir(&net_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.join("phy80211").exists() && !path.join("wireless").exists() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        interfaces.push(InterfaceInfo {
            index: read_attr(&path.join("ifindex")).and_then(|v| v.parse().ok()),
            phy: read_attr(&path.join("phy80211/name")),
            mac: read_attr(&path.join("address")),
            name,
        });
    }

    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(interfaces)
}

/// Whether a network interface with this name exists.
pub fn interface_exists(sysfs_root: &Path, name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && sysfs_root.join("class/net").join(name).exists()
}

/// Read a sysfs attribute, trimmed. `None` if missing or empty.
pub fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// An IPv4 address with a prefix length, e.g. `192.168.107.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(ApError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Ipv4Addr::from(mask)
    }

    /// The network this address belongs to (host bits cleared).
    pub fn network(&self) -> Self {
        let bits = u32::from(self.addr) & u32::from(self.netmask());
        Self {
            addr: Ipv4Addr::from(bits),
            prefix: self.prefix,
        }
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ApError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ApError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}
