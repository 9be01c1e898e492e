//! podstatsd — pod resource exporter daemon.
//!
//! Assembles the podstats subsystems:
//! - Pod spec source (watch with resume, or periodic list)
//! - Pod metrics poller
//! - Normalizer + merge worker feeding the aggregate store
//! - Scrape endpoint with response cache

pub mod pipeline;
pub mod settings;
pub mod signal;

pub use pipeline::Pipeline;
