//! Radio settings resolution and hostapd config rendering.
//!
//! Resolution is pure: the same request always yields the same settings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ApError, Result};

const DEFAULT_CHANNEL_24: u16 = 6;
const DEFAULT_CHANNEL_5: u16 = 36;

/// Wi-Fi generation. Each one carries every feature of the ones before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// 802.11g
    Legacy,
    /// 802.11n (HT)
    Wifi4,
    /// 802.11ac (VHT)
    Wifi5,
    /// 802.11ax (HE)
    #[default]
    Wifi6,
}

impl Generation {
    #[cfg(test)]
    pub const ALL: [Generation; 4] = [
        Generation::Legacy,
        Generation::Wifi4,
        Generation::Wifi5,
        Generation::Wifi6,
    ];

    fn default_band(self) -> Band {
        match self {
            Generation::Legacy | Generation::Wifi4 => Band::Ghz24,
            Generation::Wifi5 | Generation::Wifi6 => Band::Ghz5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Ghz24,
    Ghz5,
}

impl Band {
    /// Normalize user input: `None` means auto. Unknown values are auto too.
    pub fn normalize(input: &str) -> Option<Band> {
        match input.trim().to_lowercase().as_str() {
            "2.4" | "2.4ghz" | "24" | "2" | "2g" | "2ghz" => Some(Band::Ghz24),
            "5" | "5ghz" | "5g" => Some(Band::Ghz5),
            _ => None,
        }
    }

    /// hostapd `hw_mode` token.
    pub fn hw_mode(self) -> &'static str {
        match self {
            Band::Ghz24 => "g",
            Band::Ghz5 => "a",
        }
    }

    fn default_channel(self) -> u16 {
        match self {
            Band::Ghz24 => DEFAULT_CHANNEL_24,
            Band::Ghz5 => DEFAULT_CHANNEL_5,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Ghz24 => f.write_str("2.4"),
            Band::Ghz5 => f.write_str("5"),
        }
    }
}

/// Fully resolved radio settings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiSettings {
    pub generation: Generation,
    pub band: Band,
    pub channel: u16,
    pub ieee80211n: bool,
    pub ieee80211ac: bool,
    pub ieee80211ax: bool,
}

impl WifiSettings {
    /// Resolve a requested generation, band and channel (0 = default).
    pub fn resolve(generation: Generation, band: Option<&str>, channel: u16) -> Self {
        let band = band
            .and_then(Band::normalize)
            .unwrap_or_else(|| generation.default_band());
        let channel = if channel == 0 {
            band.default_channel()
        } else {
            channel
        };

        let on_5ghz = band == Band::Ghz5;
        Self {
            generation,
            band,
            channel,
            ieee80211n: generation >= Generation::Wifi4,
            // VHT does not exist outside 5 GHz
            ieee80211ac: generation >= Generation::Wifi5 && on_5ghz,
            // The highest tier's wide-channel mode is only run on 5 GHz
            ieee80211ax: generation >= Generation::Wifi6 && on_5ghz,
        }
    }

    pub fn hw_mode(&self) -> &'static str {
        self.band.hw_mode()
    }
}

impl fmt::Display for WifiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on {} GHz, channel {} (hw_mode={}, n={}, ac={}, ax={})",
            self.generation,
            self.band,
            self.channel,
            self.hw_mode(),
            self.ieee80211n,
            self.ieee80211ac,
            self.ieee80211ax
        )
    }
}

/// SSIDs are 1 to 32 bytes with no control characters.
pub fn validate_ssid(ssid: &str) -> Result<()> {
    if ssid.is_empty() || ssid.len() > 32 {
        return Err(ApError::InvalidConfig(format!(
            "SSID must be 1-32 bytes, got {}",
            ssid.len()
        )));
    }
    // A newline would start a new hostapd directive
    if ssid.chars().any(char::is_control) {
        return Err(ApError::InvalidConfig(
            "SSID must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// WPA2 passphrases are 8 to 63 printable ASCII characters.
pub fn validate_passphrase(passphrase: &str) -> Result<()> {
    let len = passphrase.len();
    if !(8..=63).contains(&len) {
        return Err(ApError::InvalidConfig(format!(
            "passphrase must be 8-63 characters, got {}",
            len
        )));
    }
    if !passphrase.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(ApError::InvalidConfig(
            "passphrase must be printable ASCII".into(),
        ));
    }
    Ok(())
}

/// Render the hostapd configuration for a WPA2-PSK access point.
pub fn render_hostapd_conf(
    iface: &str,
    ssid: &str,
    passphrase: &str,
    settings: &WifiSettings,
) -> String {
    let mut conf = format!(
        "interface={}\n\
         driver=nl80211\n\
         ssid={}\n\
         hw_mode={}\n\
         channel={}\n\
         wpa=2\n\
         wpa_passphrase={}\n\
         wpa_key_mgmt=WPA-PSK\n\
         rsn_pairwise=CCMP\n",
        iface,
        ssid,
        settings.hw_mode(),
        settings.channel,
        passphrase
    );

    for (enabled, key) in [
        (settings.ieee80211n, "ieee80211n"),
        (settings.ieee80211ac, "ieee80211ac"),
        (settings.ieee80211ax, "ieee80211ax"),
    ] {
        if enabled {
            conf.push_str(key);
            conf.push_str("=1\n");
        }
    }
    conf
}
