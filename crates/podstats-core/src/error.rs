//! Error types for podstats core parsing.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or interpreting the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors raised while parsing a resource quantity string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("malformed quantity {0:?}")]
    Malformed(String),

    #[error("quantity {quantity:?} has unknown suffix {suffix:?}")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity {0:?} overflows the supported range")]
    Overflow(String),
}
