//! Error types for connectors.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by connectors. None of them are retried by the
/// connector itself.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid api server url {0:?}")]
    InvalidUrl(String),

    #[error("credentials: {0}")]
    Credentials(String),

    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("tls: {0}")]
    Tls(String),

    #[error("http: {0}")]
    Http(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("{path} returned {status}: {message}")]
    Status {
        path: String,
        status: u16,
        message: String,
    },

    /// The source no longer holds history back to the requested token.
    #[error("resume token expired: {0}")]
    Expired(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("invalid resume marker: {0}")]
    InvalidMarker(String),
}

impl SourceError {
    pub fn is_expired(&self) -> bool {
        matches!(self, SourceError::Expired(_))
    }
}
