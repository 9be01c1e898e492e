//! AggregateStore — concurrent map from reading key to latest merged reading.
//!
//! Merges take the write lock for the duration of one merge; renders take
//! the read lock for the duration of the whole iteration, so a scrape never
//! observes a half-applied merge. Under high series cardinality that read
//! lock is a writer backpressure point.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use podstats_core::{Reading, ReadingKind};

use crate::exposition::render_readings;

/// What happens to series that stop being refreshed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Keep every key until process exit, even for objects that have
    /// disappeared from the source.
    #[default]
    Never,
    /// Drop keys that have not been merged within the given window.
    IdleFor(Duration),
}

/// How a merge changed the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Accumulated,
}

struct Entry {
    reading: Reading,
    merged_at: Instant,
}

/// Thread-safe aggregate store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AggregateStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    policy: EvictionPolicy,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::with_policy(EvictionPolicy::Never)
    }

    pub fn with_policy(policy: EvictionPolicy) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Merge one reading into the store.
    pub async fn merge(&self, reading: Reading) -> MergeOutcome {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(&reading.key) {
            None => {
                entries.insert(
                    reading.key.clone(),
                    Entry {
                        reading,
                        merged_at: now,
                    },
                );
                MergeOutcome::Inserted
            }
            Some(entry) => {
                let outcome = merge_reading(&mut entry.reading, reading);
                entry.merged_at = now;
                outcome
            }
        }
    }

    /// Latest reading stored under `key`.
    pub async fn get(&self, key: &str) -> Option<Reading> {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| e.reading.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Render the current contents as exposition text.
    ///
    /// The read lock is held until the last line is written.
    pub async fn render(&self) -> Result<String, fmt::Error> {
        let entries = self.entries.read().await;
        render_readings(entries.values().map(|e| &e.reading))
    }

    /// Apply the eviction policy. Returns the number of keys removed.
    pub async fn evict_stale(&self) -> usize {
        let EvictionPolicy::IdleFor(window) = self.policy else {
            return 0;
        };
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.merged_at) < window);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted stale series");
        }
        evicted
    }
}

impl Default for AggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Combine `incoming` into `stored` according to the incoming kind.
fn merge_reading(stored: &mut Reading, incoming: Reading) -> MergeOutcome {
    if stored.kind != incoming.kind {
        warn!(
            key = %incoming.key,
            stored = ?stored.kind,
            incoming = ?incoming.kind,
            "reading kind changed for key"
        );
    }
    match incoming.kind {
        ReadingKind::Instant => {
            stored.value = incoming.value;
            stored.time = incoming.time;
            stored.kind = incoming.kind;
            MergeOutcome::Replaced
        }
        ReadingKind::Counter => {
            stored.value += incoming.value;
            stored.time = incoming.time;
            stored.kind = incoming.kind;
            MergeOutcome::Accumulated
        }
    }
}
