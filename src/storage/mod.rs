//! Storage module for persisting traffic samples and quota alarms
//!
//! Both stores are built on [`Table`], a small versioned JSON table: one file
//! per table under the data directory holding the schema version, an id
//! counter and the records. Records live in a `BTreeMap` keyed by their
//! composite key so range scans come out ordered in either direction.

pub mod alarms;
pub mod bucket;
pub mod samples;

use fs2::FileExt;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Result, StatsError};

pub use alarms::{Alarm, AlarmStore};
pub use bucket::{TimeBasis, MAX_STORED_SAMPLES, SAMPLE_RATE_MS};
pub use samples::{CurrentStats, FirstSamplePolicy, Sample, SamplePoint, SampleSet, SampleStore, SeriesOwner, TrafficReport};

/// A value stored in a [`Table`].
pub trait Record: Clone + Serialize + DeserializeOwned {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;
}

/// Rewrites the raw records of schema version `n` into version `n + 1`.
pub type UpgradeStep = fn(Vec<Value>) -> Result<Vec<Value>>;

/// Name and upgrade path of a table. The current version is the number of steps.
pub struct Schema {
    pub name: &'static str,
    pub steps: &'static [UpgradeStep],
}

impl Schema {
    pub fn version(&self) -> u32 {
        self.steps.len() as u32
    }
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    version: u32,
    #[serde(default)]
    next_id: u64,
    records: Vec<Value>,
}

/// In-memory contents of a table.
#[derive(Debug, Clone)]
pub struct TableState<R: Record> {
    pub records: BTreeMap<R::Key, R>,
    next_id: u64,
}

impl<R: Record> TableState<R> {
    fn empty() -> Self {
        TableState { records: BTreeMap::new(), next_id: 0 }
    }

    /// Hand out the next auto-increment id. Ids are never reused.
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Insert or replace a record under its own key.
    pub fn put(&mut self, record: R) {
        self.records.insert(record.key(), record);
    }
}

/// A persistent, versioned table of records.
pub struct Table<R: Record> {
    path: PathBuf,
    version: u32,
    state: TableState<R>,
}

impl<R: Record> Table<R> {
    /// Open (or create) the table in `dir`, upgrading older files in place.
    pub async fn open(dir: &Path, schema: &Schema) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StatsError::Store(format!("Failed to create data directory {}: {}", dir.display(), e)))?;
        let path = dir.join(format!("{}.json", schema.name));
        let version = schema.version();

        if !path.exists() {
            debug!("Creating table {} at version {}", schema.name, version);
            let table = Table { path, version, state: TableState::empty() };
            table.persist(&table.state).await?;
            return Ok(table);
        }

        let content = fs::read_to_string(&path).await?;
        let file: TableFile = serde_json::from_str(&content)
            .map_err(|e| StatsError::Store(format!("Corrupt table {}: {}", path.display(), e)))?;
        if file.version > version {
            return Err(StatsError::Store(format!(
                "Table {} is at version {} but only version {} is supported",
                schema.name, file.version, version
            )));
        }

        let mut raw = file.records;
        for step in file.version..version {
            info!("Upgrading table {} from version {} to {}", schema.name, step, step + 1);
            raw = (schema.steps[step as usize])(raw)?;
        }

        let mut state = TableState { records: BTreeMap::new(), next_id: file.next_id };
        for value in raw {
            let record: R = serde_json::from_value(value)?;
            state.put(record);
        }

        let table = Table { path, version, state };
        if file.version != version {
            table.persist(&table.state).await?;
        }
        Ok(table)
    }

    pub fn records(&self) -> &BTreeMap<R::Key, R> {
        &self.state.records
    }

    /// Apply `f` to a staged copy and commit it only once it is on disk.
    pub async fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TableState<R>) -> Result<T>,
    {
        let mut staged = self.state.clone();
        let out = f(&mut staged)?;
        self.persist(&staged).await?;
        self.state = staged;
        Ok(out)
    }

    async fn persist(&self, state: &TableState<R>) -> Result<()> {
        let records = state
            .records
            .values()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let file = TableFile { version: self.version, next_id: state.next_id, records };
        let content = serde_json::to_string(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| StatsError::Store(format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StatsError::Store(format!("Failed to replace {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

/// Exclusive lock on a data directory, held for the life of the daemon.
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    pub fn acquire(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = Path::new(data_dir).join(".lock");
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.try_lock_exclusive()
            .map_err(|e| StatsError::Store(format!("Data directory {} is in use: {}", data_dir, e)))?;
        Ok(StoreLock { _file: file })
    }
}
