//! Persisted access point settings.
//!
//! Loads a JSON config from `~/.config/apshare/config.json`. A missing or
//! malformed file yields defaults; the config is validated when a run starts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApError, Result};
use crate::system::network::Ipv4Cidr;
use crate::system::services::LAN_PREFIX;
use crate::wifi::{validate_passphrase, validate_ssid, Generation};

/// Access point settings.
///
/// Every field has a serde default so old config files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wireless interface to run the AP on (None = first detected).
    pub interface: Option<String>,
    pub ssid: String,
    pub passphrase: String,
    /// Gateway address and LAN prefix, e.g. `192.168.107.1/24`.
    pub gateway: String,
    pub generation: Generation,
    /// Requested band ("2.4", "5"; anything else = auto).
    pub band: Option<String>,
    /// 0 picks the band's default channel.
    pub channel: u16,
    /// Uplink interface (None = resolve from the default route).
    pub wan_interface: Option<String>,
    pub hostapd_bin: String,
    pub dnsmasq_bin: String,
    /// Runtime files such as the rendered hostapd config.
    pub state_dir: PathBuf,
    pub stop_timeout_secs: u64,
    /// Seconds between health probes while running. 0 disables them.
    pub health_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            ssid: "apshare".into(),
            passphrase: "apshare-passphrase".into(),
            gateway: "192.168.107.1/24".into(),
            generation: Generation::default(),
            band: None,
            channel: 0,
            wan_interface: None,
            hostapd_bin: "hostapd".into(),
            dnsmasq_bin: "dnsmasq".into(),
            state_dir: PathBuf::from("/run/apshare"),
            stop_timeout_secs: 5,
            health_interval_secs: 30,
        }
    }
}

impl Config {
    /// Config file path: `~/.config/apshare/config.json`.
    ///
    /// Returns `None` if the config directory can't be determined.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("apshare").join("config.json"))
    }

    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Self {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            debug!("No config at {}, using defaults", path.display());
            return Self::default();
        };

        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Ignoring malformed config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Save config to the default path. Best-effort.
    pub fn save(&self) {
        if let Some(path) = Self::path() {
            self.save_to(&path);
        }
    }

    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let Ok(json) = serde_json::to_string_pretty(self) else {
            return;
        };

        if let Err(e) = fs::write(path, json) {
            warn!("Could not save config to {}: {}", path.display(), e);
        }
    }

    /// Check the settings a run depends on.
    pub fn validate(&self) -> Result<()> {
        validate_ssid(&self.ssid)?;
        validate_passphrase(&self.passphrase)?;
        let gateway = self.gateway()?;
        // The DHCP pool and its netmask assume a /24
        if gateway.prefix() != LAN_PREFIX {
            return Err(ApError::InvalidConfig(format!(
                "gateway {} must be a /{} network",
                gateway, LAN_PREFIX
            )));
        }
        Ok(())
    }

    pub fn gateway(&self) -> Result<Ipv4Cidr> {
        self.gateway.parse()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// `None` when health probes are disabled.
    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }

    pub fn hostapd_conf_path(&self) -> PathBuf {
        self.state_dir.join("hostapd.conf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.gateway().unwrap().to_string(), "192.168.107.1/24");
        assert_eq!(config.health_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.hostapd_conf_path(), PathBuf::from("/run/apshare/hostapd.conf"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"ssid":"cafe","generation":"wifi4","health_interval_secs":0}"#).unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.ssid, "cafe");
        assert_eq!(config.generation, Generation::Wifi4);
        assert_eq!(config.health_interval(), None);
        assert_eq!(config.passphrase, Config::default().passphrase);
    }

    #[test]
    fn test_missing_or_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(&dir.path().join("absent.json")), Config::default());

        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = Config {
            interface: Some("wlan1".into()),
            band: Some("2.4".into()),
            ..Config::default()
        };

        config.save_to(&path);
        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let short = Config {
            passphrase: "short".into(),
            ..Config::default()
        };
        assert!(matches!(short.validate(), Err(ApError::InvalidConfig(_))));

        let gateway = Config {
            gateway: "192.168.107.1".into(),
            ..Config::default()
        };
        assert!(matches!(gateway.validate(), Err(ApError::InvalidCidr(_))));

        let ssid = Config {
            ssid: String::new(),
            ..Config::default()
        };
        assert!(ssid.validate().is_err());

        let injected = Config {
            ssid: "apshare\nwpa=0".into(),
            ..Config::default()
        };
        assert!(matches!(injected.validate(), Err(ApError::InvalidConfig(_))));
    }

    #[test]
    fn test_gateway_must_match_dhcp_pool() {
        for gateway in ["192.168.107.1/28", "10.0.0.1/16"] {
            let config = Config {
                gateway: gateway.into(),
                ..Config::default()
            };
            assert!(
                matches!(config.validate(), Err(ApError::InvalidConfig(_))),
                "{gateway}"
            );
        }

        let other_net = Config {
            gateway: "10.42.0.1/24".into(),
            ..Config::default()
        };
        other_net.validate().unwrap();
    }
}
