#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use netstatsd::platform::{Collaborators, CounterSnapshot, CounterSource, InterfaceCounters, NotificationSink};
use netstatsd::storage::TimeBasis;
use netstatsd::{NetworkStatsService, StatsError, StatsHandle, StatsOptions};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CounterState {
    counters: BTreeMap<String, (u64, u64)>,
    timestamp: Option<DateTime<Utc>>,
    failing: bool,
    reads: usize,
    alarms: Vec<(String, Option<u64>)>,
}

/// Counter source driven by the test.
#[derive(Default)]
pub struct FakeCounters {
    state: Mutex<CounterState>,
}

impl FakeCounters {
    pub fn set(&self, interface: &str, rx: u64, tx: u64) {
        self.state.lock().unwrap().counters.insert(interface.to_string(), (rx, tx));
    }

    /// Timestamp stamped on every snapshot; wall clock when unset.
    pub fn set_time(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap().timestamp = Some(at);
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Number of counter queries served.
    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    /// Every `set_interface_alarm` call so far.
    pub fn alarm_calls(&self) -> Vec<(String, Option<u64>)> {
        self.state.lock().unwrap().alarms.clone()
    }

    pub fn last_alarm(&self, interface: &str) -> Option<Option<u64>> {
        self.alarm_calls().into_iter().rev().find(|(name, _)| name == interface).map(|(_, quota)| quota)
    }
}

#[async_trait]
impl CounterSource for FakeCounters {
    async fn interface_counters(&self, interface: &str) -> netstatsd::Result<CounterSnapshot> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        if state.failing {
            return Err(StatsError::CounterSource("counters unavailable".into()));
        }
        let interfaces: Vec<InterfaceCounters> = state
            .counters
            .iter()
            .filter(|(name, _)| interface.is_empty() || name.as_str() == interface)
            .map(|(name, (rx, tx))| InterfaceCounters { name: name.clone(), rx_bytes: *rx, tx_bytes: *tx })
            .collect();
        if !interface.is_empty() && interfaces.is_empty() {
            return Err(StatsError::CounterSource(format!("no interface {}", interface)));
        }
        Ok(CounterSnapshot { interfaces, timestamp: state.timestamp.unwrap_or_else(Utc::now) })
    }

    async fn set_interface_alarm(&self, interface: &str, quota: Option<u64>) -> netstatsd::Result<()> {
        self.state.lock().unwrap().alarms.push((interface.to_string(), quota));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub topic: String,
    pub payload: Value,
    /// `None` for broadcasts.
    pub origin: Option<String>,
}

/// Notification sink that remembers what it was given.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send_to_origin(&self, topic: &str, payload: &Value, origin: &str) {
        self.sent.lock().unwrap().push(Sent {
            topic: topic.into(),
            payload: payload.clone(),
            origin: Some(origin.into()),
        });
    }

    fn broadcast(&self, topic: &str, payload: &Value) {
        self.sent.lock().unwrap().push(Sent { topic: topic.into(), payload: payload.clone(), origin: None });
    }
}

pub struct Harness {
    pub handle: StatsHandle,
    pub counters: Arc<FakeCounters>,
    pub sink: Arc<RecordingSink>,
}

pub fn options(dir: &Path) -> StatsOptions {
    StatsOptions { time_basis: TimeBasis::utc(), ..StatsOptions::new(dir) }
}

pub async fn start(dir: &Path, sims: Vec<String>) -> Harness {
    start_with(options(dir), sims).await
}

pub async fn start_with(options: StatsOptions, sims: Vec<String>) -> Harness {
    let counters = Arc::new(FakeCounters::default());
    let sink = Arc::new(RecordingSink::default());
    let collaborators = Collaborators { counters: counters.clone(), notifier: sink.clone(), sims: Arc::new(sims) };
    let service = NetworkStatsService::open(options, collaborators).await.unwrap();
    Harness { handle: service.spawn(), counters, sink }
}

/// Midnight UTC `days` days before today.
pub fn days_ago(days: i64) -> DateTime<Utc> {
    let today = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap();
    Utc.from_utc_datetime(&today) - Duration::days(days)
}

/// Midnight UTC of a fixed calendar day.
pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}
