//! Command lines for the AP service (hostapd) and DHCP/DNS service (dnsmasq).

use std::net::Ipv4Addr;
use std::path::Path;

use super::supervisor::{ServiceCommand, ServiceRole};

/// Prefix length of the LAN the DHCP pool is carved from.
pub const LAN_PREFIX: u8 = 24;
const LAN_NETMASK: &str = "255.255.255.0";

/// First and last host of the DHCP pool within the listen address's /24.
const POOL_FIRST_HOST: u8 = 10;
const POOL_LAST_HOST: u8 = 200;
const LEASE_TIME: &str = "12h";

/// hostapd launched against a rendered config file.
pub fn access_point_command(program: &str, config_path: &Path) -> ServiceCommand {
    ServiceCommand {
        role: ServiceRole::AccessPoint,
        program: program.to_string(),
        args: vec![config_path.display().to_string()],
        working_dir: config_path.parent().map(Path::to_path_buf),
    }
}

/// DHCP address pool: `.10` through `.200` of the listen address's /24.
pub fn dhcp_pool(listen: Ipv4Addr) -> (Ipv4Addr, Ipv4Addr) {
    let [a, b, c, _] = listen.octets();
    (
        Ipv4Addr::new(a, b, c, POOL_FIRST_HOST),
        Ipv4Addr::new(a, b, c, POOL_LAST_HOST),
    )
}

/// dnsmasq in the foreground, bound strictly to `iface`, handing out leases
/// with `listen` as both router and resolver.
pub fn dhcp_command(program: &str, iface: &str, listen: Ipv4Addr) -> ServiceCommand {
    let (first, last) = dhcp_pool(listen);
    ServiceCommand {
        role: ServiceRole::Dhcp,
        program: program.to_string(),
        args: vec![
            "--no-daemon".into(),
            "--conf-file=/dev/null".into(),
            format!("--interface={}", iface),
            "--bind-interfaces".into(),
            format!("--listen-address={}", listen),
            format!("--dhcp-range={},{},{},{}", first, last, LAN_NETMASK, LEASE_TIME),
            format!("--dhcp-option=option:router,{}", listen),
            format!("--dhcp-option=option:dns-server,{}", listen),
        ],
        working_dir: None,
    }
}
