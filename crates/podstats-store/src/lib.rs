//! podstats-store — the authoritative map from reading key to latest value.
//!
//! # Architecture
//!
//! ```text
//! mpsc<Reading> ──► MergeWorker::run()   (single consumer)
//!                      └── AggregateStore::merge()   ← write lock per merge
//!
//! GET / ──► AggregateStore::render()    ← read lock across the whole render
//!              └── exposition::render_readings()
//! ```
//!
//! Instant readings replace the stored value; Counter readings accumulate.
//! Under the default [`EvictionPolicy::Never`] a key, once observed, stays
//! until the process exits.

pub mod exposition;
pub mod store;
pub mod worker;

pub use exposition::render_readings;
pub use store::{AggregateStore, EvictionPolicy, MergeOutcome};
pub use worker::MergeWorker;
