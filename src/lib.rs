//! Library entry for netstatsd components used by the binary and tests.
//!
//! Per-network traffic accounting: interface counters are reconciled into
//! day-bucketed samples, and quota alarms fire once when usage crosses a
//! threshold. Start with [`stats::NetworkStatsService`].

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod platform;
pub mod stats;
pub mod storage;

pub use error::{Result, StatsError};
pub use network::{LinkType, Network, NetworkInfo, NetworkStatus, NetworkType};
pub use stats::{AlarmOptions, NetworkStatsService, StatsHandle, StatsOptions, MAX_CACHED_TRAFFIC};
pub use storage::{SeriesOwner, MAX_STORED_SAMPLES, SAMPLE_RATE_MS};
