//! Linux counter source backed by `/proc/net/dev`.
//!
//! The kernel offers no per-interface quota alarm there, so alarms are kept
//! in software: arming records the interface's current byte count as a
//! baseline and [`ProcNetDev::crossed`] reports every interface whose traffic
//! since that baseline reached its quota. The daemon polls it.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, trace};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{CounterSnapshot, CounterSource, InterfaceCounters};
use crate::error::{Result, StatsError};

pub const DEFAULT_PROC_NET_DEV: &str = "/proc/net/dev";

#[derive(Debug, Clone, Copy)]
struct SoftAlarm {
    baseline: u64,
    quota: u64,
}

pub struct ProcNetDev {
    path: PathBuf,
    alarms: Mutex<HashMap<String, SoftAlarm>>,
}

impl ProcNetDev {
    pub fn new(path: impl AsRef<Path>) -> Self {
        ProcNetDev { path: path.as_ref().to_path_buf(), alarms: Mutex::new(HashMap::new()) }
    }

    async fn read_all(&self) -> Result<Vec<InterfaceCounters>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StatsError::CounterSource(format!("Failed to read {}: {}", self.path.display(), e)))?;
        parse_proc_net_dev(&content)
    }

    /// Interfaces whose armed quota has been used up. Each is reported once.
    pub async fn crossed(&self) -> Result<Vec<String>> {
        let counters = self.read_all().await?;
        let mut alarms = self
            .alarms
            .lock()
            .map_err(|_| StatsError::CounterSource("alarm table poisoned".into()))?;

        let mut out = Vec::new();
        for c in &counters {
            let Some(alarm) = alarms.get(&c.name).copied() else { continue };
            let now = c.rx_bytes.saturating_add(c.tx_bytes);
            // A counter below its baseline means the interface restarted.
            let used = now.checked_sub(alarm.baseline).unwrap_or(now);
            trace!("{} used {} of {}", c.name, used, alarm.quota);
            if used >= alarm.quota {
                alarms.remove(&c.name);
                out.push(c.name.clone());
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl CounterSource for ProcNetDev {
    async fn interface_counters(&self, interface: &str) -> Result<CounterSnapshot> {
        let mut interfaces = self.read_all().await?;
        if !interface.is_empty() {
            interfaces.retain(|c| c.name == interface);
            if interfaces.is_empty() {
                return Err(StatsError::CounterSource(format!("no counters for interface {}", interface)));
            }
        }
        Ok(CounterSnapshot { interfaces, timestamp: Utc::now() })
    }

    async fn set_interface_alarm(&self, interface: &str, quota: Option<u64>) -> Result<()> {
        if interface.is_empty() {
            return Ok(());
        }
        let baseline = match quota {
            Some(_) => {
                let snapshot = self.interface_counters(interface).await?;
                snapshot.get(interface).map(|c| c.rx_bytes.saturating_add(c.tx_bytes)).unwrap_or(0)
            }
            None => 0,
        };

        let mut alarms = self
            .alarms
            .lock()
            .map_err(|_| StatsError::CounterSource("alarm table poisoned".into()))?;
        match quota {
            Some(quota) => {
                debug!("Arming {} at {} bytes above {}", interface, quota, baseline);
                alarms.insert(interface.to_string(), SoftAlarm { baseline, quota });
            }
            None => {
                if alarms.remove(interface).is_some() {
                    debug!("Disarmed {}", interface);
                }
            }
        }
        Ok(())
    }
}

/// Parse the `/proc/net/dev` table: two header lines, then one line per
/// interface with eight receive columns followed by eight transmit columns.
pub fn parse_proc_net_dev(content: &str) -> Result<Vec<InterfaceCounters>> {
    let mut out = Vec::new();
    for line in content.lines().skip(2) {
        let Some((name, fields)) = line.split_once(':') else { continue };
        let fields: Vec<&str> = fields.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(StatsError::CounterSource(format!("short counter line for {}", name.trim())));
        }
        let number = |s: &str| {
            s.parse::<u64>()
                .map_err(|e| StatsError::CounterSource(format!("bad counter '{}' for {}: {}", s, name.trim(), e)))
        };
        out.push(InterfaceCounters {
            name: name.trim().to_string(),
            rx_bytes: number(fields[0])?,
            tx_bytes: number(fields[8])?,
        });
    }
    Ok(out)
}
