//! Error taxonomy shared by the stores, the update queue and the service.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatsError>;

/// Errors surfaced to callers of the statistics service.
///
/// The type is `Clone` because a single failed queue item resolves every
/// callback that was merged into it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatsError {
    /// Network is neither active, a known SIM, nor present in the store.
    #[error("invalid network {0}")]
    InvalidNetwork(String),

    #[error("invalid alarm threshold {0}")]
    InvalidThreshold(i64),

    /// Quota already exhausted when an alarm was evaluated.
    #[error("alarm quota already exhausted")]
    InvalidState,

    /// Owner and service type were both given, or both missing.
    #[error("invalid series: {0}")]
    InvalidSeries(String),

    #[error("counter source error: {0}")]
    CounterSource(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("network statistics service is not running")]
    ServiceStopped,
}

impl From<std::io::Error> for StatsError {
    fn from(err: std::io::Error) -> Self {
        StatsError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for StatsError {
    fn from(err: serde_json::Error) -> Self {
        StatsError::Store(err.to_string())
    }
}
