//! The network statistics service.
//!
//! A single worker task owns the stores, the pending cache, the counter
//! reconciler and the update queue. Callers hold a cloneable [`StatsHandle`]
//! and talk to the worker over a channel. Between queue turns the worker
//! drains every waiting command (so concurrent refresh requests merge), runs
//! direct requests such as queries and alarm changes, and then executes the
//! next queued [`Job`]. When idle it sleeps until the next day boundary, where
//! every connected network is booked into the day that just ended.

pub mod alarm;
pub mod cache;
pub mod queue;
pub mod reconciler;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{Result, StatsError};
use crate::metrics;
use crate::network::{Network, NetworkInfo, NetworkStatus, NetworkTable, NetworkType};
use crate::platform::{Collaborators, CounterSource, NotificationSink, SimRegistry};
use crate::storage::{
    Alarm, AlarmStore, CurrentStats, FirstSamplePolicy, SampleSet, SampleStore, SeriesOwner, TimeBasis,
    TrafficReport,
};

pub use alarm::{AlarmOptions, ALARM_TOPIC, SYSTEM_PRINCIPAL};
pub use cache::{PendingCache, MAX_CACHED_TRAFFIC};
pub use queue::{Completion, Job, UpdateQueue};
pub use reconciler::{ByteCounters, CounterReconciler};

/// Settings the service is opened with.
#[derive(Debug, Clone)]
pub struct StatsOptions {
    pub data_dir: PathBuf,
    pub time_basis: TimeBasis,
    pub first_sample_policy: FirstSamplePolicy,
    pub max_cached_traffic: u64,
}

impl StatsOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StatsOptions {
            data_dir: data_dir.into(),
            time_basis: TimeBasis::Local,
            first_sample_policy: FirstSamplePolicy::default(),
            max_cached_traffic: MAX_CACHED_TRAFFIC,
        }
    }
}

pub enum Command {
    Enqueue { job: Job, reply: Option<Completion> },
    UpdateAll { timestamp: Option<DateTime<Utc>>, reply: Completion },
    Validate { network: Network, reply: oneshot::Sender<Result<NetworkStatus>> },
    Find {
        owner: SeriesOwner,
        network: Network,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reply: oneshot::Sender<SampleSet>,
    },
    CurrentStats { network: Network, since: Option<DateTime<Utc>>, reply: oneshot::Sender<CurrentStats> },
    ReportTraffic(TrafficReport),
    SetAlarm { network: Network, threshold: u64, options: AlarmOptions, reply: oneshot::Sender<Result<u64>> },
    GetAlarms { network: Option<Network>, origin: Option<String>, reply: oneshot::Sender<Vec<Alarm>> },
    RemoveAlarm { id: u64, origin: Option<String>, reply: oneshot::Sender<Result<bool>> },
    RemoveAlarms { origin: Option<String>, reply: oneshot::Sender<Result<usize>> },
    CurrentAlarm { network: Network, reply: oneshot::Sender<Option<Alarm>> },
    Clear { network: Network, reply: Completion },
    ClearAll { reply: Completion },
    AvailableNetworks { reply: oneshot::Sender<Vec<Network>> },
    AvailableServiceTypes { reply: oneshot::Sender<Vec<String>> },
    NetworkChanged(NetworkInfo),
    NetworkRemoved { interface: String, reply: Completion },
    ThresholdCrossed { interface: String },
    TimeChanged,
    Shutdown { reply: oneshot::Sender<()> },
}

/// Client side of the service. Cheap to clone.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl StatsHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| StatsError::ServiceStopped)?;
        rx.await.map_err(|_| StatsError::ServiceStopped)
    }

    fn notify(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            debug!("Statistics service is gone, dropping event");
        }
    }

    async fn enqueue(&self, job: Job) -> Result<()> {
        self.request(|reply| Command::Enqueue { job, reply: Some(reply) }).await?
    }

    async fn validate(&self, network: &Network) -> Result<NetworkStatus> {
        let network = network.clone();
        self.request(|reply| Command::Validate { network, reply }).await?
    }

    /// Refresh one network from its interface counters.
    pub async fn update_stats(&self, network: &Network) -> Result<()> {
        self.enqueue(Job::UpdateStats { network: network.clone(), timestamp: None }).await
    }

    /// Refresh every connected network, then flush the pending cache.
    pub async fn update_all_stats(&self) -> Result<()> {
        self.request(|reply| Command::UpdateAll { timestamp: None, reply }).await?
    }

    pub async fn flush_cache(&self) -> Result<()> {
        self.enqueue(Job::FlushCache).await
    }

    /// Samples of one series, one per day between `start` and `end`.
    ///
    /// A connected network is refreshed first so the result includes traffic
    /// up to now.
    pub async fn get_samples(
        &self,
        network: &Network,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        owner: SeriesOwner,
    ) -> Result<SampleSet> {
        if self.validate(network).await? == NetworkStatus::Ready {
            if owner.is_system() {
                self.update_stats(network).await?;
            }
            self.flush_cache().await?;
        }
        let network = network.clone();
        self.request(|reply| Command::Find { owner, network, start, end, reply }).await
    }

    pub async fn current_stats(&self, network: &Network, since: Option<DateTime<Utc>>) -> Result<CurrentStats> {
        let network = network.clone();
        self.request(|reply| Command::CurrentStats { network, since, reply }).await
    }

    /// Delete the history of one network. Its alarms survive and are re-armed.
    pub async fn clear_stats(&self, network: &Network) -> Result<()> {
        self.validate(network).await?;
        self.update_stats(network).await?;
        let network = network.clone();
        self.request(|reply| Command::Clear { network, reply }).await?
    }

    pub async fn clear_all_stats(&self) -> Result<()> {
        self.update_all_stats().await?;
        self.request(|reply| Command::ClearAll { reply }).await?
    }

    /// Register a quota alarm; returns its id.
    ///
    /// An alarm whose quota is already used up fires immediately and is not
    /// stored; its id is still returned.
    pub async fn set_alarm(&self, network: &Network, threshold: i64, options: AlarmOptions) -> Result<u64> {
        let threshold = u64::try_from(threshold).map_err(|_| StatsError::InvalidThreshold(threshold))?;
        self.validate(network).await?;
        if let Err(e) = self.update_stats(network).await {
            debug!("Computing quota for {} on stored data: {}", network, e);
        }
        let network = network.clone();
        self.request(|reply| Command::SetAlarm { network, threshold, options, reply }).await?
    }

    pub async fn get_alarms(&self, network: Option<&Network>, origin: Option<&str>) -> Result<Vec<Alarm>> {
        let network = network.cloned();
        let origin = origin.map(String::from);
        self.request(|reply| Command::GetAlarms { network, origin, reply }).await
    }

    pub async fn remove_alarm(&self, id: u64, origin: Option<&str>) -> Result<bool> {
        let origin = origin.map(String::from);
        self.request(|reply| Command::RemoveAlarm { id, origin, reply }).await?
    }

    pub async fn remove_all_alarms(&self, origin: Option<&str>) -> Result<usize> {
        let origin = origin.map(String::from);
        self.request(|reply| Command::RemoveAlarms { origin, reply }).await?
    }

    /// The alarm currently armed (or waiting to be armed) for `network`.
    pub async fn current_alarm(&self, network: &Network) -> Result<Option<Alarm>> {
        let network = network.clone();
        self.request(|reply| Command::CurrentAlarm { network, reply }).await
    }

    /// Networks with stored history plus the networks of the SIMs present.
    pub async fn available_networks(&self) -> Result<Vec<Network>> {
        self.request(|reply| Command::AvailableNetworks { reply }).await
    }

    pub async fn available_service_types(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::AvailableServiceTypes { reply }).await
    }

    /// Queue traffic reported by an app or system service, dated now.
    ///
    /// Exactly one of `owner` and `service_type` must be set; that is checked
    /// here. Reports for networks the service does not know are dropped.
    pub fn report_traffic(
        &self,
        owner: &str,
        service_type: &str,
        network: &Network,
        rx_bytes: u64,
        tx_bytes: u64,
        accumulative: bool,
    ) -> Result<()> {
        let owner = SeriesOwner::from_parts(owner, service_type)?;
        let report = TrafficReport {
            owner,
            network: network.clone(),
            date: Utc::now(),
            rx_bytes,
            tx_bytes,
            accumulative,
        };
        self.submit_report(report)
    }

    /// Queue a report that carries the reporter's own timestamp.
    pub fn submit_report(&self, report: TrafficReport) -> Result<()> {
        self.tx.send(Command::ReportTraffic(report)).map_err(|_| StatsError::ServiceStopped)
    }

    /// A connection came up or changed.
    pub fn network_changed(&self, info: NetworkInfo) {
        self.notify(Command::NetworkChanged(info));
    }

    /// An interface went away; its network is refreshed one last time.
    pub async fn network_removed(&self, interface: &str) -> Result<()> {
        let interface = interface.to_string();
        self.request(|reply| Command::NetworkRemoved { interface, reply }).await?
    }

    /// The counter source reports that the armed quota of `interface` is used up.
    pub fn bandwidth_threshold_crossed(&self, interface: &str) {
        self.notify(Command::ThresholdCrossed { interface: interface.to_string() });
    }

    /// The wall clock or time zone changed.
    pub fn time_changed(&self) {
        self.notify(Command::TimeChanged);
    }

    /// Refresh everything, drain the queue and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Service with its stores open, not yet running.
pub struct NetworkStatsService {
    worker: Worker,
}

impl NetworkStatsService {
    pub async fn open(options: StatsOptions, collaborators: Collaborators) -> Result<Self> {
        let samples =
            SampleStore::open(&options.data_dir, options.time_basis, options.first_sample_policy).await?;
        let alarms = AlarmStore::open(&options.data_dir).await?;
        info!("Network statistics stored in {}", options.data_dir.display());

        let worker = Worker {
            samples,
            alarms,
            networks: NetworkTable::new(),
            reconciler: CounterReconciler::new(),
            cache: PendingCache::new(options.max_cached_traffic),
            queue: UpdateQueue::new(),
            current_alarms: HashMap::new(),
            counters: collaborators.counters,
            notifier: collaborators.notifier,
            sims: collaborators.sims,
            basis: options.time_basis,
            tick_bucket: 0,
            deadline: Instant::now(),
        };
        Ok(NetworkStatsService { worker })
    }

    /// Start the worker task.
    pub fn spawn(self) -> StatsHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.worker.run(rx));
        StatsHandle { tx }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Worker {
    samples: SampleStore,
    alarms: AlarmStore,
    networks: NetworkTable,
    reconciler: CounterReconciler,
    cache: PendingCache,
    queue: UpdateQueue,
    current_alarms: HashMap<Network, Alarm>,
    counters: Arc<dyn CounterSource>,
    notifier: Arc<dyn NotificationSink>,
    sims: Arc<dyn SimRegistry>,
    basis: TimeBasis,
    /// Bucket that was current when the day-boundary timer was set.
    tick_bucket: i64,
    deadline: Instant,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        // Counters seen before start-up were booked by the previous run.
        if let Err(e) = self.snapshot_interfaces("").await {
            warn!("Initial counter snapshot failed: {}", e);
        }
        self.init_alarms().await;

        self.schedule_tick();
        let mut closed = false;

        loop {
            while !closed {
                match rx.try_recv() {
                    Ok(cmd) => {
                        if self.handle(cmd).await == Flow::Stop {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => closed = true,
                }
            }

            if let Some(item) = self.queue.pop() {
                self.run_item(item).await;
                continue;
            }
            if closed {
                break;
            }

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd).await == Flow::Stop {
                            return;
                        }
                    }
                    None => closed = true,
                },
                _ = sleep_until(self.deadline) => {
                    // Book the day that just ended before the buckets roll over.
                    let ended = self.basis.bucket_start(self.tick_bucket);
                    info!("Day boundary reached, updating all networks");
                    self.update_all(Some(ended), None);
                    self.schedule_tick();
                }
            }
        }
        debug!("Statistics worker terminated");
    }

    fn schedule_tick(&mut self) {
        let now = Utc::now();
        let wait = (self.basis.next_boundary(now) - now).to_std().unwrap_or_default();
        self.tick_bucket = self.basis.normalize(now);
        self.deadline = Instant::now() + wait;
        debug!("Next day boundary in {}s", wait.as_secs());
    }

    fn push(&mut self, job: Job, reply: Option<Completion>) {
        if self.queue.push(job, reply) {
            metrics::inc_merged_requests();
        }
    }

    async fn handle(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Enqueue { job, reply } => self.push(job, reply),
            Command::UpdateAll { timestamp, reply } => self.update_all(timestamp, Some(reply)),
            Command::Validate { network, reply } => {
                let _ = reply.send(self.validate(&network));
            }
            Command::Find { owner, network, start, end, reply } => {
                let _ = reply.send(self.samples.find(&owner, &network, start, end));
            }
            Command::CurrentStats { network, since, reply } => {
                let _ = reply.send(self.samples.current_stats(&network, since));
            }
            Command::ReportTraffic(report) => {
                if self.networks.contains(&report.network) {
                    self.push(Job::WriteCache(report), None);
                } else {
                    debug!("Dropping traffic report for unknown network {}", report.network);
                }
            }
            Command::SetAlarm { network, threshold, options, reply } => {
                let _ = reply.send(self.set_alarm(network, threshold, options).await);
            }
            Command::GetAlarms { network, origin, reply } => {
                let _ = reply.send(self.alarms.get_alarms(network.as_ref(), origin.as_deref()));
            }
            Command::RemoveAlarm { id, origin, reply } => {
                let _ = reply.send(self.remove_alarm(id, origin.as_deref()).await);
            }
            Command::RemoveAlarms { origin, reply } => {
                let _ = reply.send(self.remove_alarms(origin.as_deref()).await);
            }
            Command::CurrentAlarm { network, reply } => {
                let _ = reply.send(self.current_alarms.get(&network).cloned());
            }
            Command::Clear { network, reply } => {
                let _ = reply.send(self.clear(&network).await);
            }
            Command::ClearAll { reply } => {
                let _ = reply.send(self.clear_all().await);
            }
            Command::AvailableNetworks { reply } => {
                let _ = reply.send(self.available_networks());
            }
            Command::AvailableServiceTypes { reply } => {
                let _ = reply.send(self.samples.available_service_types());
            }
            Command::NetworkChanged(info) => self.network_changed(info).await,
            Command::NetworkRemoved { interface, reply } => {
                let _ = reply.send(self.network_removed(&interface).await);
            }
            Command::ThresholdCrossed { interface } => self.threshold_crossed(&interface).await,
            Command::TimeChanged => {
                info!("Clock changed, updating all networks");
                self.update_all(None, None);
                self.schedule_tick();
            }
            Command::Shutdown { reply } => {
                info!("Statistics service shutting down");
                self.update_all(None, None);
                while let Some(item) = self.queue.pop() {
                    self.run_item(item).await;
                }
                let m = metrics::snapshot();
                info!(
                    "Queue turns: {}, merged requests: {}, samples written: {}, cache flushes: {}, alarms fired: {}",
                    m.queue_turns, m.merged_requests, m.samples_written, m.cache_flushes, m.alarms_fired
                );
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn run_item(&mut self, item: queue::QueueItem) {
        metrics::inc_queue_turns();
        let result = match &item.job {
            Job::UpdateStats { network, timestamp } => self.refresh(network, *timestamp).await,
            Job::FlushCache => self.flush_cache().await,
            Job::WriteCache(report) => self.write_cache(report).await,
            Job::SnapshotInterfaces { interface } => self.snapshot_interfaces(interface).await,
        };
        if let Err(e) = &result {
            warn!("{:?} failed: {}", item.job, e);
        }
        item.complete(&result);
    }

    /// Queue a refresh of every connected network followed by a cache flush
    /// that answers `reply`.
    fn update_all(&mut self, timestamp: Option<DateTime<Utc>>, reply: Option<Completion>) {
        for network in self.networks.ready() {
            self.push(Job::UpdateStats { network, timestamp }, None);
        }
        self.push(Job::FlushCache, reply);
    }

    fn validate(&mut self, network: &Network) -> Result<NetworkStatus> {
        if let Some(entry) = self.networks.get(network) {
            return Ok(entry.status);
        }
        if network.net_type == NetworkType::Mobile && self.sims.icc_ids().contains(&network.id) {
            self.networks.insert_idle(network.clone(), NetworkStatus::Standby);
            return Ok(NetworkStatus::Standby);
        }
        if self.samples.is_network_available(network) {
            self.networks.insert_idle(network.clone(), NetworkStatus::Away);
            return Ok(NetworkStatus::Away);
        }
        Err(StatsError::InvalidNetwork(network.to_string()))
    }

    fn available_networks(&self) -> Vec<Network> {
        let mut out = self.samples.available_networks();
        for icc_id in self.sims.icc_ids() {
            let network = Network::mobile(icc_id);
            if !out.contains(&network) {
                out.push(network);
            }
        }
        out
    }

    /// Read the network's counters and store the delta since the last read.
    async fn refresh(&mut self, network: &Network, timestamp: Option<DateTime<Utc>>) -> Result<()> {
        let entry = self
            .networks
            .get(network)
            .ok_or_else(|| StatsError::InvalidNetwork(network.to_string()))?;
        if entry.interface_name.is_empty() {
            return Ok(());
        }
        let interface = entry.interface_name.clone();

        let snapshot = self.counters.interface_counters(&interface).await?;
        let delta = self.reconciler.diff(&interface, &snapshot);
        let date = timestamp.unwrap_or(snapshot.timestamp);
        debug!("Update stats for {} on {}: rx {} tx {}", network, interface, delta.rx_bytes, delta.tx_bytes);

        let report = TrafficReport::system(network.clone(), date, delta.rx_bytes, delta.tx_bytes);
        self.samples.save_stats(&report).await?;
        self.reconciler.record(&snapshot);
        Ok(())
    }

    async fn snapshot_interfaces(&mut self, interface: &str) -> Result<()> {
        let snapshot = self.counters.interface_counters(interface).await?;
        self.reconciler.record(&snapshot);
        Ok(())
    }

    async fn write_cache(&mut self, report: &TrafficReport) -> Result<()> {
        let bucket = self.basis.normalize(report.date);
        if self.cache.bucket_changed(bucket) {
            if let Err(e) = self.flush_cache().await {
                // The series may still hold the previous day; never merge across days.
                if self.cache.holds(report) {
                    warn!(
                        "Dropping report of {} on {} (rx {} tx {}): previous day not written",
                        report.owner, report.network, report.rx_bytes, report.tx_bytes
                    );
                } else {
                    self.cache.add(report.clone());
                }
                return Err(e);
            }
        }
        self.cache.set_bucket(bucket);

        if let Some(key) = self.cache.add(report.clone()) {
            if let Some(entry) = self.cache.get(&key).cloned() {
                debug!("Cached traffic of {} on {} over limit, writing it out", entry.owner, entry.network);
                self.samples.save_stats(&entry).await?;
                self.cache.remove(&key);
            }
        }
        Ok(())
    }

    /// Write out the pending cache. Entries leave the cache only once stored.
    async fn flush_cache(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        metrics::inc_cache_flushes();
        debug!("Flushing {} cached entries", self.cache.len());
        for (key, entry) in self.cache.pending() {
            self.samples.save_stats(&entry).await?;
            self.cache.remove(&key);
        }
        Ok(())
    }

    async fn network_changed(&mut self, info: NetworkInfo) {
        match self.networks.connect(&info) {
            Some(network) => {
                info!("{} is up on {}", network, info.name);
                self.update_current_alarm(&network).await;
                self.push(Job::UpdateStats { network, timestamp: None }, None);
            }
            None => {
                debug!("{} is not accounted, tracking its counters only", info.name);
                self.push(Job::SnapshotInterfaces { interface: info.name }, None);
            }
        }
    }

    async fn network_removed(&mut self, interface: &str) -> Result<()> {
        let Some(network) = self.networks.find_by_interface(interface).map(|e| e.network.clone()) else {
            debug!("Removed interface {} carries no accounted network", interface);
            return Ok(());
        };
        if let Err(e) = self.refresh(&network, None).await {
            warn!("Final update of {} failed: {}", network, e);
        }
        self.networks.disconnect(interface);
        info!("{} went down", network);
        Ok(())
    }

    async fn clear(&mut self, network: &Network) -> Result<()> {
        self.samples.clear_interface_stats(network).await?;
        self.alarms.reset_alarms(network).await?;
        self.update_current_alarm(network).await;
        Ok(())
    }

    async fn clear_all(&mut self) -> Result<()> {
        let networks = self.samples.available_networks();
        self.samples.clear_stats(&networks).await?;
        for network in &networks {
            self.alarms.reset_alarms(network).await?;
            self.update_current_alarm(network).await;
        }
        Ok(())
    }
}
