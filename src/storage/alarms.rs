//! Persistent quota alarms.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use super::{Record, Schema, Table};
use crate::error::Result;
use crate::network::Network;

/// A one-shot quota trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Assigned by the store; `0` until the alarm is added.
    pub id: u64,
    pub network: Network,
    pub absolute_threshold: u64,
    /// Threshold re-expressed against the network's all-time totals, used to
    /// order alarms by which fires first.
    pub relative_threshold: u64,
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
    pub origin: Option<String>,
    pub page_url: Option<String>,
}

impl Record for Alarm {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }
}

fn create(records: Vec<Value>) -> Result<Vec<Value>> {
    Ok(records)
}

pub const ALARMS_SCHEMA: Schema = Schema { name: "net_alarm", steps: &[create] };

pub struct AlarmStore {
    table: Table<Alarm>,
}

impl AlarmStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        let table = Table::open(dir, &ALARMS_SCHEMA).await?;
        debug!("Opened alarm store with {} alarms", table.records().len());
        Ok(AlarmStore { table })
    }

    /// Take an id without storing an alarm under it.
    pub async fn reserve_id(&mut self) -> Result<u64> {
        self.table.transaction(|state| Ok(state.allocate_id())).await
    }

    /// Store `alarm`, assigning an id when it has none. Returns the id.
    pub async fn add_alarm(&mut self, alarm: &Alarm) -> Result<u64> {
        let mut alarm = alarm.clone();
        let id = self
            .table
            .transaction(|state| {
                if alarm.id == 0 {
                    alarm.id = state.allocate_id();
                }
                let id = alarm.id;
                state.put(alarm);
                Ok(id)
            })
            .await?;
        debug!("Stored alarm {}", id);
        Ok(id)
    }

    /// The alarm of `network` that fires first.
    pub fn first_alarm(&self, network: &Network) -> Option<Alarm> {
        self.table
            .records()
            .values()
            .filter(|a| &a.network == network)
            .min_by_key(|a| (a.relative_threshold, a.id))
            .cloned()
    }

    pub fn get(&self, id: u64) -> Option<&Alarm> {
        self.table.records().get(&id)
    }

    /// Delete alarm `id`. With an origin, only an alarm of that origin is removed.
    pub async fn remove_alarm(&mut self, id: u64, origin: Option<&str>) -> Result<bool> {
        let matches = match self.table.records().get(&id) {
            Some(alarm) => origin.map_or(true, |o| alarm.origin.as_deref() == Some(o)),
            None => false,
        };
        if !matches {
            return Ok(false);
        }
        self.table.transaction(|state| Ok(state.records.remove(&id).is_some())).await
    }

    /// Delete every alarm owned by `origin`; returns the removed alarms.
    pub async fn remove_alarms(&mut self, origin: Option<&str>) -> Result<Vec<Alarm>> {
        self.table
            .transaction(|state| {
                let ids: Vec<u64> = state
                    .records
                    .values()
                    .filter(|a| a.origin.as_deref() == origin)
                    .map(|a| a.id)
                    .collect();
                Ok(ids.iter().filter_map(|id| state.records.remove(id)).collect())
            })
            .await
    }

    /// Alarms owned by `origin`, optionally restricted to one network.
    pub fn get_alarms(&self, network: Option<&Network>, origin: Option<&str>) -> Vec<Alarm> {
        self.table
            .records()
            .values()
            .filter(|a| a.origin.as_deref() == origin)
            .filter(|a| network.map_or(true, |n| &a.network == n))
            .cloned()
            .collect()
    }

    /// Every stored alarm, by id.
    pub fn all(&self) -> Vec<Alarm> {
        self.table.records().values().cloned().collect()
    }

    /// After a stats clear, start-time alarms measure from zero again.
    pub async fn reset_alarms(&mut self, network: &Network) -> Result<()> {
        self.table
            .transaction(|state| {
                for alarm in state.records.values_mut() {
                    if &alarm.network == network && alarm.start_time.is_some() {
                        alarm.relative_threshold = alarm.absolute_threshold;
                    }
                }
                Ok(())
            })
            .await
    }
}
