//! Turns cumulative interface counters into per-read deltas.
//!
//! State is in-memory only and rebuilt from the first observation after
//! start-up; the sample store's totals are what persists.

use log::trace;
use std::collections::HashMap;

use crate::platform::CounterSnapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Default)]
pub struct CounterReconciler {
    last: HashMap<String, ByteCounters>,
}

fn delta(now: u64, prev: u64) -> u64 {
    // A counter below the previous reading was reset with the interface.
    now.checked_sub(prev).unwrap_or(now)
}

impl CounterReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta of `interface` between the last recorded reading and `snapshot`.
    /// Nothing is committed; call [`record`](Self::record) once the delta is
    /// safely stored.
    pub fn diff(&self, interface: &str, snapshot: &CounterSnapshot) -> ByteCounters {
        let Some(now) = snapshot.get(interface) else {
            return ByteCounters::default();
        };
        let prev = self.last.get(interface).copied().unwrap_or_default();
        let out = ByteCounters {
            rx_bytes: delta(now.rx_bytes, prev.rx_bytes),
            tx_bytes: delta(now.tx_bytes, prev.tx_bytes),
        };
        trace!("{}: {:?} -> {:?} = {:?}", interface, prev, now, out);
        out
    }

    /// Remember every interface reading of `snapshot`.
    pub fn record(&mut self, snapshot: &CounterSnapshot) {
        for c in &snapshot.interfaces {
            self.last.insert(c.name.clone(), ByteCounters { rx_bytes: c.rx_bytes, tx_bytes: c.tx_bytes });
        }
    }

    pub fn last(&self, interface: &str) -> Option<ByteCounters> {
        self.last.get(interface).copied()
    }
}
