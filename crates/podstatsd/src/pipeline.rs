//! Wires connectors, the normalizer, and the merge worker together.
//!
//! ```text
//! Poller / ResumeDriver ──mpsc<RawObject>──► Normalizer ──mpsc<Reading>──► MergeWorker ──► AggregateStore
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use podstats_core::RawObject;
use podstats_source::{Lister, Normalizer, Poller, ResumeDriver, Watcher};
use podstats_store::{AggregateStore, MergeWorker};

/// Running pipeline tasks feeding one store.
pub struct Pipeline {
    objects: mpsc::Sender<RawObject>,
    shutdown: watch::Receiver<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Spawn the normalizer and merge worker. Connectors are added with
    /// [`Pipeline::spawn_poller`] and [`Pipeline::spawn_watcher`].
    pub fn start(
        store: AggregateStore,
        normalizer: Normalizer,
        queue_capacity: usize,
        sweep_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (objects_tx, objects_rx) = mpsc::channel(queue_capacity);
        let (readings_tx, readings_rx) = mpsc::channel(queue_capacity);

        let normalize = tokio::spawn(normalizer.run(objects_rx, readings_tx, shutdown.clone()));
        let worker = MergeWorker::new(store).with_sweep_interval(sweep_interval);
        let merge = tokio::spawn(worker.run(readings_rx, shutdown.clone()));

        info!(queue_capacity, "pipeline started");

        Self {
            objects: objects_tx,
            shutdown,
            tasks: vec![("normalizer", normalize), ("merge-worker", merge)],
        }
    }

    pub fn spawn_poller<L: Lister>(&mut self, poller: Poller<L>) {
        let handle = tokio::spawn(poller.run(self.objects.clone(), self.shutdown.clone()));
        self.tasks.push(("poller", handle));
    }

    pub fn spawn_watcher<W: Watcher>(&mut self, name: &'static str, driver: ResumeDriver<W>) {
        let objects = self.objects.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let token = driver.run(objects, shutdown).await;
            debug!(watcher = name, %token, "watcher finished");
        });
        self.tasks.push(("watcher", handle));
    }

    /// Wait for every task to finish. Call after shutdown is signalled.
    pub async fn join(self) {
        drop(self.objects);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "pipeline task panicked");
            }
        }
        info!("pipeline stopped");
    }
}
