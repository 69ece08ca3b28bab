//! Process-wide service counters.
//!
//! Plain relaxed atomics; a [`snapshot`] is logged when the service shuts down.
use std::sync::atomic::{AtomicU64, Ordering};

static QUEUE_TURNS: AtomicU64 = AtomicU64::new(0);
static MERGED_REQUESTS: AtomicU64 = AtomicU64::new(0);
static SAMPLES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static CACHE_FLUSHES: AtomicU64 = AtomicU64::new(0);
static ALARMS_FIRED: AtomicU64 = AtomicU64::new(0);

pub fn inc_queue_turns() { QUEUE_TURNS.fetch_add(1, Ordering::Relaxed); }
pub fn inc_merged_requests() { MERGED_REQUESTS.fetch_add(1, Ordering::Relaxed); }
pub fn inc_samples_written(n: u64) { SAMPLES_WRITTEN.fetch_add(n, Ordering::Relaxed); }
pub fn inc_cache_flushes() { CACHE_FLUSHES.fetch_add(1, Ordering::Relaxed); }
pub fn inc_alarms_fired() { ALARMS_FIRED.fetch_add(1, Ordering::Relaxed); }

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub queue_turns: u64,
    pub merged_requests: u64,
    pub samples_written: u64,
    pub cache_flushes: u64,
    pub alarms_fired: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        queue_turns: QUEUE_TURNS.load(Ordering::Relaxed),
        merged_requests: MERGED_REQUESTS.load(Ordering::Relaxed),
        samples_written: SAMPLES_WRITTEN.load(Ordering::Relaxed),
        cache_flushes: CACHE_FLUSHES.load(Ordering::Relaxed),
        alarms_fired: ALARMS_FIRED.load(Ordering::Relaxed),
    }
}
