//! podstats-core — shared vocabulary for the podstats pipeline.
//!
//! Defines the canonical [`Reading`], the raw objects connectors hand to the
//! normalizer, Kubernetes resource [`Quantity`] parsing, and the daemon's
//! TOML configuration.

pub mod config;
pub mod error;
pub mod quantity;
pub mod types;

pub use config::PodstatsConfig;
pub use error::{ConfigError, QuantityError};
pub use quantity::Quantity;
pub use types::*;
