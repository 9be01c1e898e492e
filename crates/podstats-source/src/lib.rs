//! podstats-source — everything upstream of the aggregate store.
//!
//! # Architecture
//!
//! ```text
//! PodLister / PodMetricsLister ──► Poller::run()        (one task per lister, ticker)
//! PodWatcher ──► ResumeDriver::run()                    (one task per watcher)
//!                  └── ResumeTracker (token, reconnect state)
//!                          │
//!                          ▼  mpsc<RawObject>
//!                  Normalizer::run()                    (one task)
//!                          │
//!                          ▼  mpsc<Reading>
//!                  podstats_store::MergeWorker
//! ```
//!
//! Connectors never retry. The poller retries on its next tick; the resume
//! driver reconnects after a fixed delay, forever, carrying the last
//! bookmark token so the new stream continues where the old one stopped.

pub mod client;
pub mod connector;
pub mod error;
pub mod kube;
pub mod normalize;
pub mod poller;
pub mod resume;

pub use client::{ApiClient, ApiClientConfig};
pub use connector::{ListOptions, Lister, ResumeMarker, WatchEvent, WatchOptions, WatchStream, Watcher};
pub use error::SourceError;
pub use kube::{PodLister, PodMetricsLister, PodWatcher};
pub use normalize::{LabelSanitizer, Normalizer};
pub use poller::Poller;
pub use resume::{ResumeDriver, ResumeState, ResumeTracker};
