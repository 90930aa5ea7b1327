//! Periodic task scheduling.
//!
//! Each task runs on its own `tokio::time::interval`; a failed run is logged
//! and retried on the next tick, so the cadence itself is the retry
//! mechanism. Overlap within one key is suppressed by the in-flight
//! registry, never queued.

use crate::agstats::aggregator::PeriodAggregator;
use crate::agstats::snapshot::BalanceSnapshotter;
use crate::agcommon::models::Timeframe;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

/// Per-key mutual exclusion: `try_begin` hands out a guard that releases the
/// key on drop, or `None` when a holder for the same key is still alive.
pub struct InFlightRegistry {
    keys: Arc<Mutex<HashSet<&'static str>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn try_begin(&self, key: &'static str) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap();
        if keys.insert(key) {
            Some(InFlightGuard {
                keys: self.keys.clone(),
                key,
            })
        } else {
            None
        }
    }
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<&'static str>>>,
    key: &'static str,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.lock().unwrap().remove(self.key);
    }
}

/// Spawn the aggregation loop for one timeframe. The first tick fires
/// immediately, so startup includes an initial catch-up pass.
pub fn spawn_aggregation_task(
    aggregator: Arc<PeriodAggregator>,
    timeframe: Timeframe,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = aggregator.aggregate(timeframe).await {
                error!("aggregation pass for {:?} failed: {}", timeframe, e);
            }
        }
    })
}

/// Spawn the balance snapshot loop. Fires every minute; the snapshotter
/// itself gates to at most one snapshot per hour.
pub fn spawn_snapshot_task(snapshotter: Arc<BalanceSnapshotter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = snapshotter.snapshot() {
                error!("balance snapshot failed: {}", e);
            }
        }
    })
}
