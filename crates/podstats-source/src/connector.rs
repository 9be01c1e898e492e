//! Connector abstractions: point-in-time listing and resumable watching.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use podstats_core::{RawObject, ResumeToken};

use crate::error::SourceError;

/// Options for a full snapshot fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Ask the source for best-effort consistency bookmarks.
    pub allow_watch_bookmarks: bool,
    pub label_selector: Option<String>,
}

/// Options for opening an event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Continue after this token; empty starts from the current state.
    pub resume_token: ResumeToken,
    /// Ask the source to interleave resume markers with object events.
    pub allow_watch_bookmarks: bool,
    pub label_selector: Option<String>,
    /// Server-side stream lifetime.
    pub timeout: Option<Duration>,
}

/// Raw payload of a resume marker, converted to a token on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeMarker {
    payload: Value,
}

impl ResumeMarker {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Marker carrying `token` in the same shape the API server sends.
    pub fn from_token(token: &str) -> Self {
        Self::new(serde_json::json!({ "metadata": { "resourceVersion": token } }))
    }

    /// Extract the resumption token (`metadata.resourceVersion`).
    pub fn token(&self) -> Result<ResumeToken, SourceError> {
        match self.payload.pointer("/metadata/resourceVersion") {
            Some(Value::String(version)) if !version.is_empty() => Ok(ResumeToken::new(version.as_str())),
            Some(other) => Err(SourceError::InvalidMarker(format!(
                "resourceVersion is not a non-empty string: {other}"
            ))),
            None => Err(SourceError::InvalidMarker("missing metadata.resourceVersion".to_string())),
        }
    }
}

/// One item of a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Object(RawObject),
    Marker(ResumeMarker),
}

type StreamItem = Result<WatchEvent, SourceError>;

/// A live event stream. Ends (`None`) when the source closes it; an `Err`
/// item reports a stream failure and is followed by nothing useful.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::Receiver<StreamItem>,
}

impl WatchStream {
    /// A stream fed through the returned sender. Dropping the sender ends
    /// the stream; dropping the stream makes sends fail.
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamItem>, WatchStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, WatchStream { rx })
    }

    /// A finite stream that yields `items` and then ends.
    pub fn from_items(items: Vec<StreamItem>) -> WatchStream {
        let (tx, stream) = Self::channel(items.len().max(1));
        for item in items {
            // Capacity covers every item, so this never fails.
            let _ = tx.try_send(item);
        }
        stream
    }

    pub async fn next(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}

/// Point-in-time fetch of every object of one resource type.
pub trait Lister: Send + Sync + 'static {
    fn list(
        &self,
        options: &ListOptions,
    ) -> impl Future<Output = Result<Vec<RawObject>, SourceError>> + Send;
}

/// Continuous event stream over one resource type.
pub trait Watcher: Send + Sync + 'static {
    fn watch(&self, options: &WatchOptions) -> impl Future<Output = Result<WatchStream, SourceError>> + Send;
}
