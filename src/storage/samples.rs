//! Day-bucketed traffic samples.
//!
//! Each series is identified by an owner and a network and holds at most one
//! [`Sample`] per day bucket. Writes are reconciled against the latest stored
//! bucket of the series: the next day appends, a gap is back-filled with
//! zero-byte buckets, and a late or repeated report is merged into the latest
//! bucket in place.

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use super::bucket::{max_storage_age_ms, TimeBasis, MAX_STORED_SAMPLES, SAMPLE_RATE_MS};
use super::{Record, Schema, Table, TableState};
use crate::error::{Result, StatsError};
use crate::metrics;
use crate::network::{Network, NetworkType};

/// Owner string of the whole-device series.
pub const SYSTEM_OWNER: &str = "default";

/// Who a series belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesOwner {
    /// Traffic of the whole device.
    System,
    /// Traffic attributed to one application, by manifest URL.
    App(String),
    /// Traffic attributed to a system service type (mms, ota, ...).
    Service(String),
}

impl SeriesOwner {
    /// Build an owner from the owner / service type pair used on the wire.
    ///
    /// Exactly one of the two must be non-empty. An owner of `"default"`
    /// names the whole-device series.
    pub fn from_parts(owner: &str, service_type: &str) -> Result<Self> {
        match (owner.is_empty(), service_type.is_empty()) {
            (false, false) => Err(StatsError::InvalidSeries(format!(
                "owner '{}' and service type '{}' are mutually exclusive",
                owner, service_type
            ))),
            (true, true) => Err(StatsError::InvalidSeries("owner or service type is required".into())),
            (false, true) if owner == SYSTEM_OWNER => Ok(SeriesOwner::System),
            (false, true) => Ok(SeriesOwner::App(owner.to_string())),
            (true, false) => Ok(SeriesOwner::Service(service_type.to_string())),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, SeriesOwner::System)
    }
}

impl fmt::Display for SeriesOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesOwner::System => f.write_str(SYSTEM_OWNER),
            SeriesOwner::App(origin) => write!(f, "app:{}", origin),
            SeriesOwner::Service(service_type) => write!(f, "service:{}", service_type),
        }
    }
}

impl FromStr for SeriesOwner {
    type Err = StatsError;

    /// Accepts `default`, `app:<origin>` and `service:<type>`.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(origin) = s.strip_prefix("app:") {
            SeriesOwner::from_parts(origin, "")
        } else if let Some(service_type) = s.strip_prefix("service:") {
            SeriesOwner::from_parts("", service_type)
        } else {
            SeriesOwner::from_parts(s, "")
        }
    }
}

/// How the first accumulative sample of a new series is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstSamplePolicy {
    /// Count the raw counters as traffic, unless another series of the same
    /// network type already has history (a second SIM coming up), in which
    /// case the new series starts from zero.
    #[default]
    ZeroWhenTypeShared,
    /// Always count the raw counters as traffic of the first bucket.
    SeedFromCounters,
}

/// One day of traffic for one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub owner: SeriesOwner,
    pub network: Network,
    pub timestamp: i64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_system_bytes: u64,
    pub tx_system_bytes: u64,
    pub rx_total_bytes: u64,
    pub tx_total_bytes: u64,
}

pub type SampleKey = (SeriesOwner, Network, i64);

impl Record for Sample {
    type Key = SampleKey;

    fn key(&self) -> SampleKey {
        (self.owner.clone(), self.network.clone(), self.timestamp)
    }
}

impl Sample {
    fn zeroed_at(&self, timestamp: i64) -> Sample {
        Sample { timestamp, rx_bytes: 0, tx_bytes: 0, ..self.clone() }
    }
}

/// A traffic observation to be written into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub owner: SeriesOwner,
    pub network: Network,
    pub date: DateTime<Utc>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Byte counts are cumulative counters rather than a delta.
    pub accumulative: bool,
}

impl TrafficReport {
    /// A delta report for the whole-device series.
    pub fn system(network: Network, date: DateTime<Utc>, rx_bytes: u64, tx_bytes: u64) -> Self {
        TrafficReport { owner: SeriesOwner::System, network, date, rx_bytes, tx_bytes, accumulative: false }
    }

    pub fn with_owner(mut self, owner: SeriesOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn accumulative(mut self) -> Self {
        self.accumulative = true;
        self
    }
}

/// One row of a [`SampleSet`]. `None` marks a bucket without data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplePoint {
    pub date: DateTime<Utc>,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
}

/// Gap-free result of [`SampleStore::find`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleSet {
    pub owner: SeriesOwner,
    pub network: Network,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub data: Vec<SamplePoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CurrentStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_total_bytes: u64,
    pub tx_total_bytes: u64,
}

fn create(records: Vec<Value>) -> Result<Vec<Value>> {
    Ok(records)
}

/// Version 1 stored a free-form `origin` next to `service_type`.
fn origin_to_owner(records: Vec<Value>) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(records.len());
    for mut record in records {
        let origin = record["origin"].as_str().unwrap_or_default().to_string();
        let service_type = record["service_type"].as_str().unwrap_or_default().to_string();
        let owner = if !service_type.is_empty() {
            if !origin.is_empty() {
                continue;
            }
            json!({ "service": service_type })
        } else if origin.is_empty() || origin == SYSTEM_OWNER {
            json!("system")
        } else if origin.ends_with(".localhost") {
            json!({ "app": format!("{}/manifest.webmanifest", origin) })
        } else {
            debug!("Dropping legacy samples of origin {}", origin);
            continue;
        };
        if let Some(fields) = record.as_object_mut() {
            fields.remove("origin");
            fields.remove("service_type");
            fields.insert("owner".into(), owner);
        }
        out.push(record);
    }
    Ok(out)
}

pub const SAMPLES_SCHEMA: Schema = Schema { name: "net_stats", steps: &[create, origin_to_owner] };

fn series_range(owner: &SeriesOwner, network: &Network) -> RangeInclusive<SampleKey> {
    (owner.clone(), network.clone(), i64::MIN)..=(owner.clone(), network.clone(), i64::MAX)
}

/// Persistent per-series traffic history.
pub struct SampleStore {
    table: Table<Sample>,
    basis: TimeBasis,
    policy: FirstSamplePolicy,
}

impl SampleStore {
    pub async fn open(dir: &Path, basis: TimeBasis, policy: FirstSamplePolicy) -> Result<Self> {
        let table = Table::open(dir, &SAMPLES_SCHEMA).await?;
        debug!("Opened sample store with {} samples", table.records().len());
        Ok(SampleStore { table, basis, policy })
    }

    pub fn time_basis(&self) -> TimeBasis {
        self.basis
    }

    pub fn len(&self) -> usize {
        self.table.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.records().is_empty()
    }

    /// Write one observation, reconciling it against the series' latest bucket.
    pub async fn save_stats(&mut self, report: &TrafficReport) -> Result<()> {
        let timestamp = self.basis.normalize(report.date);
        let anchor_timestamp = self.basis.normalize(Utc::now());
        let policy = self.policy;
        let accumulative = report.accumulative;

        let mut sample = Sample {
            owner: report.owner.clone(),
            network: report.network.clone(),
            timestamp,
            rx_bytes: if accumulative { 0 } else { report.rx_bytes },
            tx_bytes: if accumulative { 0 } else { report.tx_bytes },
            rx_system_bytes: if accumulative { report.rx_bytes } else { 0 },
            tx_system_bytes: if accumulative { report.tx_bytes } else { 0 },
            rx_total_bytes: if accumulative { report.rx_bytes } else { 0 },
            tx_total_bytes: if accumulative { report.tx_bytes } else { 0 },
        };
        trace!("Saving {:?}", sample);

        let written = self
            .table
            .transaction(|state| {
                let latest = state
                    .records
                    .range(series_range(&sample.owner, &sample.network))
                    .next_back()
                    .map(|(_, s)| s.clone());

                let written = match latest {
                    None => {
                        seed_first_sample(state, &mut sample, accumulative, policy);
                        state.put(sample.clone());
                        1
                    }
                    Some(last) => process_samples_diff(state, last, sample.clone(), accumulative)?,
                };
                remove_old_stats(state, &sample.owner, &sample.network, timestamp, anchor_timestamp);
                Ok(written)
            })
            .await?;

        metrics::inc_samples_written(written);
        Ok(())
    }

    /// Samples of a series between `start` and `end`, one per bucket.
    pub fn find(&self, owner: &SeriesOwner, network: &Network, start: DateTime<Utc>, end: DateTime<Utc>) -> SampleSet {
        let start_ts = self.basis.normalize(start);
        let end_ts = self.basis.normalize(end);
        debug!("Find samples for {} on {} from {} until {}", owner, network, start_ts, end_ts);

        let mut data = Vec::new();
        if start_ts > end_ts {
            return SampleSet { owner: owner.clone(), network: network.clone(), start, end, data };
        }

        let lower = (owner.clone(), network.clone(), start_ts);
        let upper = (owner.clone(), network.clone(), end_ts);
        let mut rows = self.table.records().range(lower..=upper).map(|(_, s)| s).peekable();

        let mut first = true;
        let mut ts = start_ts;
        while ts <= end_ts {
            let date = self.basis.bucket_start(ts);
            match rows.next_if(|s| s.timestamp == ts) {
                // The oldest row reports totals so expired history still counts.
                Some(sample) if first => {
                    first = false;
                    data.push(SamplePoint {
                        date,
                        rx_bytes: Some(sample.rx_total_bytes),
                        tx_bytes: Some(sample.tx_total_bytes),
                    });
                }
                Some(sample) => data.push(SamplePoint {
                    date,
                    rx_bytes: Some(sample.rx_bytes),
                    tx_bytes: Some(sample.tx_bytes),
                }),
                None => data.push(SamplePoint { date, rx_bytes: None, tx_bytes: None }),
            }
            ts += SAMPLE_RATE_MS;
        }

        SampleSet { owner: owner.clone(), network: network.clone(), start, end, data }
    }

    /// Usage of the whole-device series since `since` (or all time) plus its totals.
    pub fn current_stats(&self, network: &Network, since: Option<DateTime<Utc>>) -> CurrentStats {
        let mut series = self.table.records().range(series_range(&SeriesOwner::System, network));
        let Some((_, latest)) = series.next_back() else {
            return CurrentStats::default();
        };

        let mut stats = CurrentStats {
            rx_bytes: latest.rx_total_bytes,
            tx_bytes: latest.tx_total_bytes,
            rx_total_bytes: latest.rx_total_bytes,
            tx_total_bytes: latest.tx_total_bytes,
        };

        if let Some(since) = since {
            let start = self.basis.normalize(since);
            let lower = (SeriesOwner::System, network.clone(), start);
            let upper = (SeriesOwner::System, network.clone(), i64::MAX);
            match self.table.records().range(lower..=upper).next() {
                Some((_, first)) => {
                    let rx_before = first.rx_total_bytes.saturating_sub(first.rx_bytes);
                    let tx_before = first.tx_total_bytes.saturating_sub(first.tx_bytes);
                    stats.rx_bytes = latest.rx_total_bytes.saturating_sub(rx_before);
                    stats.tx_bytes = latest.tx_total_bytes.saturating_sub(tx_before);
                }
                None => {
                    stats.rx_bytes = 0;
                    stats.tx_bytes = 0;
                }
            }
        }
        stats
    }

    /// Drop every row of `network`, keeping a zeroed whole-device anchor so
    /// the next accumulative report still reconciles against the counters.
    pub async fn clear_interface_stats(&mut self, network: &Network) -> Result<()> {
        self.clear_stats(std::slice::from_ref(network)).await
    }

    pub async fn clear_stats(&mut self, networks: &[Network]) -> Result<()> {
        let anchor_timestamp = self.basis.normalize(Utc::now());
        self.table
            .transaction(|state| {
                for network in networks {
                    let doomed: Vec<SampleKey> =
                        state.records.keys().filter(|(_, n, _)| n == network).cloned().collect();
                    let anchor = state
                        .records
                        .range(series_range(&SeriesOwner::System, network))
                        .next_back()
                        .map(|(_, s)| s.clone());
                    for key in &doomed {
                        state.records.remove(key);
                    }
                    debug!("Cleared {} samples of {}", doomed.len(), network);

                    if let Some(last) = anchor {
                        state.put(Sample {
                            rx_total_bytes: 0,
                            tx_total_bytes: 0,
                            ..last.zeroed_at(anchor_timestamp)
                        });
                    }
                }
                Ok(())
            })
            .await
    }

    /// Networks with any stored history.
    pub fn available_networks(&self) -> Vec<Network> {
        let set: BTreeSet<&Network> = self.table.records().keys().map(|(_, n, _)| n).collect();
        set.into_iter().cloned().collect()
    }

    pub fn is_network_available(&self, network: &Network) -> bool {
        self.table.records().keys().any(|(_, n, _)| n == network)
    }

    pub fn available_service_types(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .table
            .records()
            .keys()
            .filter_map(|(owner, _, _)| match owner {
                SeriesOwner::Service(service_type) => Some(service_type.as_str()),
                _ => None,
            })
            .collect();
        set.into_iter().map(String::from).collect()
    }

    /// Raw rows of one series, oldest first.
    pub fn series(&self, owner: &SeriesOwner, network: &Network) -> Vec<Sample> {
        self.table.records().range(series_range(owner, network)).map(|(_, s)| s.clone()).collect()
    }
}

/// Seed the first bucket of an empty series.
fn seed_first_sample(state: &TableState<Sample>, sample: &mut Sample, accumulative: bool, policy: FirstSamplePolicy) {
    if !accumulative {
        sample.rx_total_bytes = sample.rx_bytes;
        sample.tx_total_bytes = sample.tx_bytes;
        return;
    }

    // Traffic between interface start-up and the first report is counted.
    sample.rx_bytes = sample.rx_total_bytes;
    sample.tx_bytes = sample.tx_total_bytes;

    if policy == FirstSamplePolicy::ZeroWhenTypeShared && type_has_history(state, sample.network.net_type) {
        debug!("{} shares its network type with stored history, starting from zero", sample.network);
        sample.rx_bytes = 0;
        sample.tx_bytes = 0;
        sample.rx_total_bytes = 0;
        sample.tx_total_bytes = 0;
    }
}

fn type_has_history(state: &TableState<Sample>, net_type: NetworkType) -> bool {
    state.records.keys().any(|(_, n, _)| n.net_type == net_type)
}

/// Reconcile `new` against the latest bucket `last`; returns rows written.
fn process_samples_diff(state: &mut TableState<Sample>, mut last: Sample, mut new: Sample, accumulative: bool) -> Result<u64> {
    let elapsed = new.timestamp - last.timestamp;
    if elapsed % SAMPLE_RATE_MS != 0 {
        return Err(StatsError::Store(format!(
            "samples of {} at {} and {} are not bucket aligned",
            new.network, last.timestamp, new.timestamp
        )));
    }
    let diff = elapsed / SAMPLE_RATE_MS;
    trace!("New: {} - Last: {} - diff: {}", new.timestamp, last.timestamp, diff);

    let (rx_diff, tx_diff) = if accumulative {
        let (rx, tx) = match (
            new.rx_system_bytes.checked_sub(last.rx_system_bytes),
            new.tx_system_bytes.checked_sub(last.tx_system_bytes),
        ) {
            (Some(rx), Some(tx)) => (rx, tx),
            // Counters went backwards: the interface was reset.
            _ => (new.rx_system_bytes, new.tx_system_bytes),
        };
        new.rx_bytes = rx;
        new.tx_bytes = tx;
        new.rx_total_bytes = last.rx_total_bytes.saturating_add(rx);
        new.tx_total_bytes = last.tx_total_bytes.saturating_add(tx);
        (rx, tx)
    } else {
        new.rx_total_bytes = last.rx_total_bytes.saturating_add(new.rx_bytes);
        new.tx_total_bytes = last.tx_total_bytes.saturating_add(new.tx_bytes);
        (new.rx_bytes, new.tx_bytes)
    };

    if diff >= 1 {
        let periods = diff.min(MAX_STORED_SAMPLES);
        for i in (0..periods - 1).rev() {
            state.put(last.zeroed_at(new.timestamp - SAMPLE_RATE_MS * (i + 1)));
        }
        if periods > 1 {
            debug!("Filled {} missing buckets of {} on {}", periods - 1, new.owner, new.network);
        }
        state.put(new);
        return Ok(periods as u64);
    }

    // Same or earlier bucket (restart, clock or timezone change): merge into
    // the latest bucket.
    last.rx_bytes = last.rx_bytes.saturating_add(rx_diff);
    last.tx_bytes = last.tx_bytes.saturating_add(tx_diff);
    last.rx_system_bytes = new.rx_system_bytes;
    last.tx_system_bytes = new.tx_system_bytes;
    last.rx_total_bytes = last.rx_total_bytes.saturating_add(rx_diff);
    last.tx_total_bytes = last.tx_total_bytes.saturating_add(tx_diff);
    state.put(last);
    Ok(1)
}

/// Prune buckets that fell out of the retention window relative to
/// `timestamp`. An emptied series gets its last row back as a zero anchor.
fn remove_old_stats(
    state: &mut TableState<Sample>,
    owner: &SeriesOwner,
    network: &Network,
    timestamp: i64,
    anchor_timestamp: i64,
) {
    let filter = (timestamp - (max_storage_age_ms() - 1)).max(0);
    let lower = (owner.clone(), network.clone(), i64::MIN);
    let upper = (owner.clone(), network.clone(), filter);
    let doomed: Vec<SampleKey> = state.records.range(lower..=upper).map(|(k, _)| k.clone()).collect();
    if doomed.is_empty() {
        return;
    }

    let mut last_removed = None;
    for key in &doomed {
        last_removed = state.records.remove(key);
    }
    debug!("Pruned {} expired samples of {} on {}", doomed.len(), owner, network);

    let emptied = state.records.range(series_range(owner, network)).next().is_none();
    if let (true, Some(last)) = (emptied, last_removed) {
        state.put(last.zeroed_at(anchor_timestamp));
    }
}
