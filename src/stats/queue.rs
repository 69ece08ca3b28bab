//! The update queue.
//!
//! Every store mutation runs as one [`Job`] taken off this queue, one at a
//! time. Requests for a subject that already has a job waiting ride along
//! with it instead of queueing a duplicate; all of them receive that job's
//! result.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::network::Network;
use crate::storage::TrafficReport;

pub type Completion = oneshot::Sender<Result<()>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Read the network's interface counters and store the delta. With a
    /// timestamp the delta is booked into that bucket.
    UpdateStats { network: Network, timestamp: Option<DateTime<Utc>> },
    /// Write every pending cache entry to the store.
    FlushCache,
    /// Add one reported observation to the pending cache.
    WriteCache(TrafficReport),
    /// Refresh the reconciler's view of an interface (all when empty).
    SnapshotInterfaces { interface: String },
}

/// What a job works on; jobs with equal subjects are mergeable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Network(Network),
    Cache,
    Interfaces,
}

impl Job {
    pub fn subject(&self) -> Subject {
        match self {
            Job::UpdateStats { network, .. } => Subject::Network(network.clone()),
            Job::FlushCache | Job::WriteCache(_) => Subject::Cache,
            Job::SnapshotInterfaces { .. } => Subject::Interfaces,
        }
    }

    /// Each cache write carries its own payload and never absorbs others.
    fn mergeable(&self) -> bool {
        !matches!(self, Job::WriteCache(_))
    }
}

#[derive(Debug)]
pub struct QueueItem {
    pub job: Job,
    callbacks: Vec<Completion>,
}

impl QueueItem {
    /// Hand `result` to every caller waiting on this item.
    pub fn complete(self, result: &Result<()>) {
        for callback in self.callbacks {
            let _ = callback.send(result.clone());
        }
    }

    pub fn waiters(&self) -> usize {
        self.callbacks.len()
    }
}

#[derive(Debug, Default)]
pub struct UpdateQueue {
    items: VecDeque<QueueItem>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `job`. Returns true when it merged into a waiting item.
    ///
    /// A job merges into the last waiting item of its subject, so a flush
    /// queued after a cache write still runs after that write.
    pub fn push(&mut self, job: Job, callback: Option<Completion>) -> bool {
        let subject = job.subject();
        if job.mergeable() {
            if let Some(item) = self.items.iter_mut().rev().find(|i| i.job.subject() == subject) {
                if item.job.mergeable() {
                    item.callbacks.extend(callback);
                    return true;
                }
            }
        }
        self.items.push_back(QueueItem { job, callbacks: callback.into_iter().collect() });
        false
    }

    /// Take the next item to run. Once popped it no longer absorbs requests.
    pub fn pop(&mut self) -> Option<QueueItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
