//! System interaction modules: commands, firewall rules, interfaces, routes
//! and supervised services.

pub mod command;
pub mod firewall;
pub mod interface;
pub mod network;
pub mod route;
pub mod rules;
pub mod services;
pub mod supervisor;
pub mod sysctl;

pub use command::{CommandRunner, SystemRunner};
pub use firewall::FirewallPolicy;
pub use interface::{InterfaceController, PgrepTerminator, RoleTerminator};
pub use network::{detect_wireless_interfaces, interface_exists};
pub use route::{IpRouteSource, RouteSource};
pub use rules::RuleManager;
pub use supervisor::{
    GroupTerminator, ProcessLauncher, ServiceLauncher, ServiceRole, UnixGroupTerminator,
};
pub use sysctl::IpForwarding;
