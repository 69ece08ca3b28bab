//! Pending cache for traffic reported outside the periodic refresh.
//!
//! Reporters such as per-app accounting send many small reports; they are
//! summed here per series and written to the sample store in one go. All
//! cached entries belong to the same day bucket.

use log::trace;
use std::collections::BTreeMap;

use crate::network::Network;
use crate::storage::{SeriesOwner, TrafficReport};

/// Bytes a cached entry may accumulate in either direction before it is
/// written out on its own.
pub const MAX_CACHED_TRAFFIC: u64 = 500 * 1000 * 1000;

pub type CacheKey = (SeriesOwner, Network, bool);

#[derive(Debug)]
pub struct PendingCache {
    entries: BTreeMap<CacheKey, TrafficReport>,
    bucket: Option<i64>,
    limit: u64,
}

impl PendingCache {
    pub fn new(limit: u64) -> Self {
        PendingCache { entries: BTreeMap::new(), bucket: None, limit }
    }

    /// True when `bucket` differs from the bucket of the cached entries.
    pub fn bucket_changed(&self, bucket: i64) -> bool {
        !self.entries.is_empty() && self.bucket.is_some_and(|b| b != bucket)
    }

    pub fn set_bucket(&mut self, bucket: i64) {
        self.bucket = Some(bucket);
    }

    /// Accumulate `report`. Returns the key of an entry that went over the
    /// limit and should be written now.
    pub fn add(&mut self, report: TrafficReport) -> Option<CacheKey> {
        let key = (report.owner.clone(), report.network.clone(), report.accumulative);
        match self.entries.get_mut(&key) {
            // Cumulative counters supersede the previous reading.
            Some(entry) if report.accumulative => *entry = report,
            Some(entry) => {
                entry.rx_bytes = entry.rx_bytes.saturating_add(report.rx_bytes);
                entry.tx_bytes = entry.tx_bytes.saturating_add(report.tx_bytes);
                trace!("Cached {} on {}: rx {} tx {}", key.0, key.1, entry.rx_bytes, entry.tx_bytes);
                if entry.rx_bytes > self.limit || entry.tx_bytes > self.limit {
                    return Some(key);
                }
            }
            None => {
                let over = !report.accumulative && (report.rx_bytes > self.limit || report.tx_bytes > self.limit);
                self.entries.insert(key.clone(), report);
                if over {
                    return Some(key);
                }
            }
        }
        None
    }

    /// True when a report for the series of `report` is already cached.
    pub fn holds(&self, report: &TrafficReport) -> bool {
        self.entries.contains_key(&(report.owner.clone(), report.network.clone(), report.accumulative))
    }

    pub fn get(&self, key: &CacheKey) -> Option<&TrafficReport> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<TrafficReport> {
        self.entries.remove(key)
    }

    /// Snapshot of the entries waiting to be written.
    pub fn pending(&self) -> Vec<(CacheKey, TrafficReport)> {
        self.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
