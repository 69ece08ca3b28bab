//! # Configuration Management Module
//!
//! Configuration for the `netstatsd` daemon, read from a TOML file.
//!
//! ## Configuration Structure
//!
//! - [`StorageConfig`] - where the sample and alarm tables live
//! - [`StatsConfig`] - accounting policy (cache limit, day boundary, dual-SIM seeding)
//! - [`CountersConfig`] - interface counter source
//! - [`NotificationsConfig`] - where alarm notifications go
//! - [`RadioConfig`] - SIM cards known to be present
//! - [`InterfaceConfig`] - interfaces announced at start-up
//! - [`LoggingConfig`] - log level and log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use netstatsd::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Data directory: {}", config.storage.data_dir);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//!
//! [stats]
//! max_cached_traffic = 500000000
//! first_sample_policy = "zero_when_type_shared"
//! # timezone_offset_minutes = 60
//! threshold_poll_secs = 5
//!
//! [counters]
//! proc_net_dev = "/proc/net/dev"
//!
//! [radio]
//! icc_ids = ["8934071100276980483"]
//!
//! [[interfaces]]
//! name = "wlan0"
//! kind = "wifi"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::network::{LinkType, NetworkInfo};
use crate::platform::procfs::DEFAULT_PROC_NET_DEV;
use crate::stats::{StatsOptions, MAX_CACHED_TRAFFIC};
use crate::storage::{FirstSamplePolicy, TimeBasis};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub counters: CountersConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Bytes a cached report may reach before it is written on its own.
    #[serde(default = "default_max_cached_traffic")]
    pub max_cached_traffic: u64,
    #[serde(default)]
    pub first_sample_policy: FirstSamplePolicy,
    /// Fixed day boundary as minutes east of UTC; the local time zone when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_offset_minutes: Option<i32>,
    /// How often software interface alarms are checked.
    #[serde(default = "default_threshold_poll_secs")]
    pub threshold_poll_secs: u64,
}

fn default_max_cached_traffic() -> u64 {
    MAX_CACHED_TRAFFIC
}

fn default_threshold_poll_secs() -> u64 {
    5
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            max_cached_traffic: default_max_cached_traffic(),
            first_sample_policy: FirstSamplePolicy::default(),
            timezone_offset_minutes: None,
            threshold_poll_secs: default_threshold_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersConfig {
    pub proc_net_dev: String,
}

impl Default for CountersConfig {
    fn default() -> Self {
        CountersConfig { proc_net_dev: DEFAULT_PROC_NET_DEV.to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// JSON-lines file that alarm notifications are appended to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadioConfig {
    #[serde(default)]
    pub icc_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: LinkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icc_id: Option<String>,
    #[serde(default = "default_metered")]
    pub metered: bool,
}

fn default_metered() -> bool {
    true
}

impl InterfaceConfig {
    pub fn network_info(&self) -> NetworkInfo {
        NetworkInfo {
            name: self.name.clone(),
            link_type: self.kind,
            icc_id: self.icc_id.clone(),
            metered: self.metered,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content).await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.trim().is_empty() {
            return Err(anyhow!("storage.data_dir must not be empty"));
        }
        if self.stats.max_cached_traffic == 0 {
            return Err(anyhow!("stats.max_cached_traffic must be positive"));
        }
        if self.stats.threshold_poll_secs == 0 {
            return Err(anyhow!("stats.threshold_poll_secs must be positive"));
        }
        if let Some(minutes) = self.stats.timezone_offset_minutes {
            if TimeBasis::fixed_minutes(minutes).is_none() || minutes.abs() >= 24 * 60 {
                return Err(anyhow!("stats.timezone_offset_minutes {} is out of range", minutes));
            }
        }
        for iface in &self.interfaces {
            if iface.name.trim().is_empty() {
                return Err(anyhow!("interface name must not be empty"));
            }
            if iface.kind.is_mobile() && iface.icc_id.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow!("mobile interface {} needs an icc_id", iface.name));
            }
        }
        Ok(())
    }

    pub fn time_basis(&self) -> TimeBasis {
        self.stats
            .timezone_offset_minutes
            .and_then(TimeBasis::fixed_minutes)
            .unwrap_or(TimeBasis::Local)
    }

    pub fn stats_options(&self) -> StatsOptions {
        StatsOptions {
            data_dir: PathBuf::from(&self.storage.data_dir),
            time_basis: self.time_basis(),
            first_sample_policy: self.stats.first_sample_policy,
            max_cached_traffic: self.stats.max_cached_traffic,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig { data_dir: "./data".to_string() },
            stats: StatsConfig::default(),
            counters: CountersConfig::default(),
            notifications: NotificationsConfig { file: Some("alarms.jsonl".to_string()) },
            radio: RadioConfig::default(),
            interfaces: vec![InterfaceConfig {
                name: "wlan0".to_string(),
                kind: LinkType::Wifi,
                icc_id: None,
                metered: false,
            }],
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("netstatsd.log".to_string()),
            },
        }
    }
}
