//! Quota alarms: computing the remaining quota, arming the soonest alarm of a
//! network against its interface, and firing.
//!
//! At most one alarm per network is armed at a time; the rest wait in the
//! alarm store ordered by relative threshold. Firing deletes the alarm, sends
//! one notification and arms the next.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};

use super::Worker;
use crate::error::{Result, StatsError};
use crate::metrics;
use crate::network::Network;
use crate::storage::{Alarm, CurrentStats};

/// Topic of alarm notifications.
pub const ALARM_TOPIC: &str = "networkstats-alarm";

/// Origin of alarms set by the platform itself; their notifications are broadcast.
pub const SYSTEM_PRINCIPAL: &str = "[System Principal]";

/// Optional parts of an alarm request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmOptions {
    /// Count usage from this instant instead of all time.
    pub start_time: Option<DateTime<Utc>>,
    /// Opaque payload echoed back in the notification.
    pub data: Value,
    pub origin: Option<String>,
    pub page_url: Option<String>,
}

/// Bytes left before `alarm` is due, given the network's usage. Also
/// recomputes the alarm's relative threshold.
pub fn alarm_quota(stats: &CurrentStats, alarm: &mut Alarm) -> Result<u64> {
    let used = stats.rx_bytes.saturating_add(stats.tx_bytes);
    let quota = alarm.absolute_threshold.checked_sub(used).filter(|q| *q > 0).ok_or(StatsError::InvalidState)?;

    alarm.relative_threshold = if alarm.start_time.is_some() {
        stats.rx_total_bytes.saturating_add(stats.tx_total_bytes).saturating_add(quota)
    } else {
        alarm.absolute_threshold
    };
    Ok(quota)
}

/// Notification payload for a fired alarm.
pub fn alarm_payload(alarm: &Alarm) -> Value {
    json!({
        "id": alarm.id,
        "threshold": alarm.absolute_threshold,
        "data": alarm.data,
    })
}

impl Worker {
    fn quota_for(&self, alarm: &mut Alarm) -> Result<u64> {
        let stats = self.samples.current_stats(&alarm.network, alarm.start_time);
        alarm_quota(&stats, alarm)
    }

    fn live_interface(&self, network: &Network) -> Option<String> {
        self.networks.get(network).filter(|e| e.is_live()).map(|e| e.interface_name.clone())
    }

    pub(super) async fn init_alarms(&mut self) {
        debug!("Init usage alarms");
        for network in self.networks.networks() {
            self.update_current_alarm(&network).await;
        }
    }

    pub(super) async fn set_alarm(&mut self, network: Network, threshold: u64, options: AlarmOptions) -> Result<u64> {
        let mut alarm = Alarm {
            id: 0,
            network,
            absolute_threshold: threshold,
            relative_threshold: threshold,
            start_time: options.start_time,
            data: options.data,
            origin: options.origin,
            page_url: options.page_url,
        };

        match self.quota_for(&mut alarm) {
            Ok(_) => {}
            Err(StatsError::InvalidState) => {
                alarm.id = self.alarms.reserve_id().await?;
                info!("Alarm {} at {} bytes on {} is already due", alarm.id, threshold, alarm.network);
                self.notify(&alarm);
                return Ok(alarm.id);
            }
            Err(e) => return Err(e),
        }

        alarm.id = self.alarms.add_alarm(&alarm).await?;
        info!("Alarm {} set at {} bytes on {}", alarm.id, threshold, alarm.network);
        match self.arm(alarm.clone()).await {
            Ok(()) => Ok(alarm.id),
            Err(StatsError::InvalidState) => {
                self.fire_alarm(alarm.clone()).await;
                Ok(alarm.id)
            }
            Err(e) => Err(e),
        }
    }

    /// Make `alarm` the network's current alarm unless a sooner one is
    /// current. On a live interface the remaining quota is armed there.
    async fn arm(&mut self, mut alarm: Alarm) -> Result<()> {
        if let Some(current) = self.current_alarms.get(&alarm.network) {
            if current.relative_threshold < alarm.relative_threshold {
                return Ok(());
            }
        }

        let Some(interface) = self.live_interface(&alarm.network) else {
            debug!("{} is not connected, alarm {} waits", alarm.network, alarm.id);
            self.current_alarms.insert(alarm.network.clone(), alarm);
            return Ok(());
        };

        if self.reconciler.last(&interface).is_none() {
            debug!("No baseline for {} yet, arming alarm {} on stored data", interface, alarm.id);
        } else if let Err(e) = self.refresh(&alarm.network, None).await {
            debug!("Arming alarm {} on stored data: {}", alarm.id, e);
        }
        let quota = self.quota_for(&mut alarm)?;
        self.counters.set_interface_alarm(&interface, Some(quota)).await?;
        debug!("Armed alarm {} on {} with {} bytes left", alarm.id, interface, quota);
        self.current_alarms.insert(alarm.network.clone(), alarm);
        Ok(())
    }

    /// Re-evaluate which alarm of `network` is current, firing any that are
    /// already due. With no alarms left the interface alarm is disarmed.
    pub(super) async fn update_current_alarm(&mut self, network: &Network) {
        self.current_alarms.remove(network);
        loop {
            let Some(alarm) = self.alarms.first_alarm(network) else {
                if let Some(interface) = self.live_interface(network) {
                    if let Err(e) = self.counters.set_interface_alarm(&interface, None).await {
                        warn!("Failed to disarm {}: {}", interface, e);
                    }
                }
                return;
            };

            match self.arm(alarm.clone()).await {
                Ok(()) => return,
                Err(StatsError::InvalidState) => {
                    if !matches!(self.discharge(&alarm).await, Ok(true)) {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Failed to arm alarm {}: {}", alarm.id, e);
                    return;
                }
            }
        }
    }

    /// Delete `alarm` and notify its owner. `Ok(false)` means it had already
    /// been removed and nothing was sent.
    async fn discharge(&mut self, alarm: &Alarm) -> Result<bool> {
        let removed = self.alarms.remove_alarm(alarm.id, None).await;
        match &removed {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(e) => warn!("Failed to delete fired alarm {}: {}", alarm.id, e),
        }
        self.notify(alarm);
        removed
    }

    pub(super) async fn fire_alarm(&mut self, alarm: Alarm) {
        info!("Alarm {} on {} fired", alarm.id, alarm.network);
        if let Ok(false) = self.discharge(&alarm).await {
            debug!("Alarm {} was already gone", alarm.id);
            return;
        }
        self.update_current_alarm(&alarm.network).await;
    }

    fn notify(&self, alarm: &Alarm) {
        metrics::inc_alarms_fired();
        let payload = alarm_payload(alarm);
        match alarm.origin.as_deref() {
            Some(origin) if !origin.is_empty() && origin != SYSTEM_PRINCIPAL => {
                self.notifier.send_to_origin(ALARM_TOPIC, &payload, origin)
            }
            _ => self.notifier.broadcast(ALARM_TOPIC, &payload),
        }
    }

    pub(super) async fn threshold_crossed(&mut self, interface: &str) {
        let Some(network) = self.networks.find_by_interface(interface).map(|e| e.network.clone()) else {
            debug!("Threshold crossed on unknown interface {}", interface);
            return;
        };
        match self.current_alarms.get(&network).cloned() {
            Some(alarm) => self.fire_alarm(alarm).await,
            None => debug!("Threshold crossed on {} without a current alarm", interface),
        }
    }

    pub(super) async fn remove_alarm(&mut self, id: u64, origin: Option<&str>) -> Result<bool> {
        let removed = self.alarms.remove_alarm(id, origin).await?;
        if removed {
            let network = self.current_alarms.iter().find(|(_, a)| a.id == id).map(|(n, _)| n.clone());
            if let Some(network) = network {
                self.update_current_alarm(&network).await;
            }
        }
        Ok(removed)
    }

    pub(super) async fn remove_alarms(&mut self, origin: Option<&str>) -> Result<usize> {
        let removed = self.alarms.remove_alarms(origin).await?;
        let mut affected: Vec<Network> = self
            .current_alarms
            .iter()
            .filter(|(_, current)| removed.iter().any(|a| a.id == current.id))
            .map(|(n, _)| n.clone())
            .collect();
        affected.sort();
        for network in &affected {
            self.update_current_alarm(network).await;
        }
        Ok(removed.len())
    }
}
