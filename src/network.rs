//! Network identities and the runtime table of known networks.
//!
//! A [`Network`] is what samples and alarms are keyed by: Wi-Fi always uses
//! id `"0"`, mobile networks use the SIM ICCID. The [`NetworkTable`] maps
//! those identities to the physical interface currently carrying them.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Id used for the single Wi-Fi network.
pub const WIFI_NETWORK_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Mobile,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Wifi => "wifi",
            NetworkType::Mobile => "mobile",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(NetworkType::Wifi),
            "mobile" => Ok(NetworkType::Mobile),
            other => Err(format!("unknown network type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(rename = "type")]
    pub net_type: NetworkType,
}

impl Network {
    pub fn new(id: impl Into<String>, net_type: NetworkType) -> Self {
        Network { id: id.into(), net_type }
    }

    pub fn wifi() -> Self {
        Network::new(WIFI_NETWORK_ID, NetworkType::Wifi)
    }

    pub fn mobile(icc_id: impl Into<String>) -> Self {
        Network::new(icc_id, NetworkType::Mobile)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net_type, self.id)
    }
}

impl FromStr for Network {
    type Err = String;

    /// Accepts `wifi` or `mobile/<iccid>`, the form [`Display`](fmt::Display) writes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once('/').unwrap_or((s, ""));
        match (kind.parse::<NetworkType>()?, id) {
            (NetworkType::Wifi, "") | (NetworkType::Wifi, WIFI_NETWORK_ID) => Ok(Network::wifi()),
            (NetworkType::Mobile, "") => Err("mobile networks are written mobile/<iccid>".to_string()),
            (NetworkType::Mobile, icc_id) => Ok(Network::mobile(icc_id)),
            (NetworkType::Wifi, other) => Err(format!("unknown wifi network '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// Connected; the interface name is known.
    Ready,
    /// Valid (e.g. a SIM is inserted) but not connected since start-up.
    Standby,
    /// Known only from stored history.
    Away,
}

/// Link type as reported by the connection observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Wifi,
    Mobile,
    MobileMms,
    MobileSupl,
    MobileIms,
    MobileDun,
    MobileFota,
    MobileHipri,
    MobileCbs,
    MobileIa,
    MobileEcc,
    MobileXcap,
    Ethernet,
    Other,
}

impl LinkType {
    pub fn is_mobile(&self) -> bool {
        matches!(
            self,
            LinkType::Mobile
                | LinkType::MobileMms
                | LinkType::MobileSupl
                | LinkType::MobileIms
                | LinkType::MobileDun
                | LinkType::MobileFota
                | LinkType::MobileHipri
                | LinkType::MobileCbs
                | LinkType::MobileIa
                | LinkType::MobileEcc
                | LinkType::MobileXcap
        )
    }
}

/// A connection-state report from the network-state observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Physical interface name (wlan0, rmnet0, ...).
    pub name: String,
    pub link_type: LinkType,
    /// ICCID of the SIM carrying a mobile link.
    pub icc_id: Option<String>,
    pub metered: bool,
}

impl NetworkInfo {
    pub fn wifi(name: impl Into<String>) -> Self {
        NetworkInfo { name: name.into(), link_type: LinkType::Wifi, icc_id: None, metered: false }
    }

    pub fn mobile(name: impl Into<String>, icc_id: impl Into<String>) -> Self {
        NetworkInfo {
            name: name.into(),
            link_type: LinkType::Mobile,
            icc_id: Some(icc_id.into()),
            metered: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub network: Network,
    pub interface_name: String,
    pub status: NetworkStatus,
}

impl NetworkEntry {
    /// True when stats can be read for this network right now.
    pub fn is_live(&self) -> bool {
        self.status == NetworkStatus::Ready && !self.interface_name.is_empty()
    }
}

/// Networks the service currently knows about.
#[derive(Debug, Clone)]
pub struct NetworkTable {
    entries: HashMap<Network, NetworkEntry>,
}

impl NetworkTable {
    /// Wi-Fi is always present: its driver is only loaded while enabled, so
    /// it cannot be discovered ahead of time.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        let wifi = Network::wifi();
        entries.insert(
            wifi.clone(),
            NetworkEntry { network: wifi, interface_name: String::new(), status: NetworkStatus::Standby },
        );
        NetworkTable { entries }
    }

    pub fn get(&self, network: &Network) -> Option<&NetworkEntry> {
        self.entries.get(network)
    }

    pub fn contains(&self, network: &Network) -> bool {
        self.entries.contains_key(network)
    }

    /// Register a network that is valid but has no live interface.
    pub fn insert_idle(&mut self, network: Network, status: NetworkStatus) {
        self.entries.insert(
            network.clone(),
            NetworkEntry { network, interface_name: String::new(), status },
        );
    }

    /// Map an observer report onto an accounted network and mark it Ready.
    ///
    /// Returns `None` for links that are not accounted: non-metered mobile,
    /// mobile without an ICCID, and anything that is neither mobile nor Wi-Fi.
    pub fn connect(&mut self, info: &NetworkInfo) -> Option<Network> {
        let network = if info.link_type.is_mobile() {
            let Some(icc_id) = info.icc_id.as_deref().filter(|id| !id.is_empty()) else {
                debug!("Mobile link {} carries no ICCID, not accounted", info.name);
                return None;
            };
            if !info.metered {
                return None;
            }
            Network::mobile(icc_id)
        } else if info.link_type == LinkType::Wifi {
            Network::wifi()
        } else {
            return None;
        };

        let entry = self.entries.entry(network.clone()).or_insert_with(|| NetworkEntry {
            network: network.clone(),
            interface_name: String::new(),
            status: NetworkStatus::Standby,
        });
        entry.status = NetworkStatus::Ready;
        entry.interface_name = info.name.clone();
        Some(network)
    }

    /// Detach an interface; its network drops back to Standby.
    pub fn disconnect(&mut self, interface: &str) -> Option<Network> {
        let entry = self
            .entries
            .values_mut()
            .find(|e| !interface.is_empty() && e.interface_name == interface)?;
        entry.interface_name.clear();
        entry.status = NetworkStatus::Standby;
        Some(entry.network.clone())
    }

    pub fn find_by_interface(&self, interface: &str) -> Option<&NetworkEntry> {
        if interface.is_empty() {
            return None;
        }
        self.entries.values().find(|e| e.interface_name == interface)
    }

    /// Networks with a live interface, in a stable order.
    pub fn ready(&self) -> Vec<Network> {
        let mut out: Vec<Network> =
            self.entries.values().filter(|e| e.is_live()).map(|e| e.network.clone()).collect();
        out.sort();
        out
    }

    pub fn networks(&self) -> Vec<Network> {
        let mut out: Vec<Network> = self.entries.keys().cloned().collect();
        out.sort();
        out
    }
}

impl Default for NetworkTable {
    fn default() -> Self {
        Self::new()
    }
}
