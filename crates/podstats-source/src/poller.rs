//! Poller — drives a [`Lister`] on a fixed interval.
//!
//! Each tick fetches a full snapshot and forwards every object downstream.
//! A failed fetch is logged and the next tick tries again.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use podstats_core::RawObject;

use crate::connector::{ListOptions, Lister};

pub struct Poller<L> {
    name: &'static str,
    lister: L,
    interval: Duration,
    options: ListOptions,
}

impl<L: Lister> Poller<L> {
    /// A poller ticking every 10s with bookmarks requested.
    pub fn new(name: &'static str, lister: L) -> Self {
        Self {
            name,
            lister,
            interval: Duration::from_secs(10),
            options: ListOptions {
                allow_watch_bookmarks: true,
                label_selector: None,
            },
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_options(mut self, options: ListOptions) -> Self {
        self.options = options;
        self
    }

    /// Poll until shutdown is signalled or the downstream queue closes.
    ///
    /// The first fetch happens immediately. A list that completes after
    /// shutdown has been signalled is discarded.
    pub async fn run(self, objects: mpsc::Sender<RawObject>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(poller = self.name, interval_secs = self.interval.as_secs_f64(), "poller started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(poller = self.name, "poller shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let result = self.lister.list(&self.options).await;
            if *shutdown.borrow() {
                debug!(poller = self.name, "discarding list completed after shutdown");
                return;
            }

            let items = match result {
                Ok(items) => items,
                Err(e) => {
                    warn!(poller = self.name, error = %e, "list failed, retrying next tick");
                    continue;
                }
            };
            debug!(poller = self.name, count = items.len(), "listed objects");

            for item in items {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(poller = self.name, "poller shutting down");
                        return;
                    }
                    sent = objects.send(item) => {
                        if sent.is_err() {
                            debug!(poller = self.name, "object queue closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
