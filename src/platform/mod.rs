//! Collaborators the statistics service depends on.
//!
//! The service never talks to the kernel or to clients directly: byte
//! counters and interface quota alarms come from a [`CounterSource`],
//! alarm notifications leave through a [`NotificationSink`], and the SIMs
//! present are listed by a [`SimRegistry`]. The daemon wires in
//! [`procfs::ProcNetDev`] and [`notify::JsonlNotifier`]; tests wire in fakes.

pub mod notify;
pub mod procfs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

/// Raw counters of one interface since it came up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Result of one counter query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub interfaces: Vec<InterfaceCounters>,
    /// When the counters were read.
    pub timestamp: DateTime<Utc>,
}

impl CounterSnapshot {
    pub fn get(&self, name: &str) -> Option<&InterfaceCounters> {
        self.interfaces.iter().find(|c| c.name == name)
    }
}

#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Counters of `interface`, or of every interface when it is empty.
    async fn interface_counters(&self, interface: &str) -> Result<CounterSnapshot>;

    /// Arm a quota alarm on `interface`: signal once `quota` more bytes
    /// have been transferred. `None` disarms it.
    async fn set_interface_alarm(&self, interface: &str, quota: Option<u64>) -> Result<()>;
}

pub trait NotificationSink: Send + Sync {
    fn send_to_origin(&self, topic: &str, payload: &Value, origin: &str);
    fn broadcast(&self, topic: &str, payload: &Value);
}

pub trait SimRegistry: Send + Sync {
    /// ICCIDs of the SIM cards currently present.
    fn icc_ids(&self) -> Vec<String>;
}

impl SimRegistry for Vec<String> {
    fn icc_ids(&self) -> Vec<String> {
        self.clone()
    }
}

/// Everything injected into the service.
#[derive(Clone)]
pub struct Collaborators {
    pub counters: Arc<dyn CounterSource>,
    pub notifier: Arc<dyn NotificationSink>,
    pub sims: Arc<dyn SimRegistry>,
}
