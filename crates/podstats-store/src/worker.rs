//! MergeWorker — the single consumer that owns writes to the store.
//!
//! All readings flow through one bounded queue into this worker, so two
//! merges for the same key are always applied one after the other, in
//! queue order.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use podstats_core::Reading;

use crate::store::{AggregateStore, EvictionPolicy};

pub struct MergeWorker {
    store: AggregateStore,
    sweep_interval: Duration,
}

impl MergeWorker {
    pub fn new(store: AggregateStore) -> Self {
        Self {
            store,
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// How often the eviction policy is applied (ignored under `Never`).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Merge readings until the queue closes or shutdown is signalled.
    pub async fn run(
        self,
        mut readings: mpsc::Receiver<Reading>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let evicting = self.store.policy() != EvictionPolicy::Never;
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut merged: u64 = 0;

        info!(policy = ?self.store.policy(), "merge worker started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(merged, "merge worker shutting down");
                    break;
                }
                next = readings.recv() => {
                    let Some(reading) = next else {
                        debug!(merged, "reading queue closed");
                        break;
                    };
                    self.store.merge(reading).await;
                    merged += 1;
                }
                _ = sweep.tick(), if evicting => {
                    self.store.evict_stale().await;
                }
            }
        }
    }
}
