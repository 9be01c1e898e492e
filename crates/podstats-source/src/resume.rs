//! Resumable watching.
//!
//! [`ResumeTracker`] holds the pure state machine: the current state and
//! the last bookmark token. [`ResumeDriver`] runs it against a live
//! [`Watcher`], reconnecting forever until shutdown.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Streaming
//!      ▲                        │                 │
//!      └────────fail────────────┘                 │
//!      └──────────────closed / error──────────────┘
//! any ──shutdown──► Closed
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use podstats_core::{RawObject, ResumeToken};

use crate::connector::{WatchEvent, WatchOptions, Watcher};
use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    Disconnected,
    Connecting,
    Streaming,
    Closed,
}

/// Connection state and resume token for one watched resource.
#[derive(Debug)]
pub struct ResumeTracker {
    template: WatchOptions,
    token: ResumeToken,
    state: ResumeState,
}

impl ResumeTracker {
    /// Start disconnected, resuming from `template.resume_token`.
    pub fn new(template: WatchOptions) -> Self {
        Self {
            token: template.resume_token.clone(),
            template,
            state: ResumeState::Disconnected,
        }
    }

    pub fn state(&self) -> ResumeState {
        self.state
    }

    pub fn token(&self) -> &ResumeToken {
        &self.token
    }

    /// Begin a connection attempt. Returns the options to watch with, or
    /// `None` once closed.
    pub fn connect(&mut self) -> Option<WatchOptions> {
        if self.state == ResumeState::Closed {
            return None;
        }
        self.state = ResumeState::Connecting;
        Some(WatchOptions {
            resume_token: self.token.clone(),
            ..self.template.clone()
        })
    }

    pub fn connected(&mut self) {
        if self.state == ResumeState::Connecting {
            self.state = ResumeState::Streaming;
        }
    }

    pub fn connect_failed(&mut self, error: &SourceError) {
        self.disconnect(Some(error));
    }

    /// Apply one stream event. Objects are handed back for forwarding;
    /// markers only move the token.
    pub fn on_event(&mut self, event: WatchEvent) -> Option<RawObject> {
        if self.state != ResumeState::Streaming {
            return None;
        }
        match event {
            WatchEvent::Object(object) => Some(object),
            WatchEvent::Marker(marker) => {
                match marker.token() {
                    Ok(token) => self.token = token,
                    Err(e) => warn!(error = %e, token = %self.token, "ignoring malformed resume marker"),
                }
                None
            }
        }
    }

    /// The stream ended, cleanly (`None`) or with an error.
    pub fn stream_ended(&mut self, error: Option<&SourceError>) {
        self.disconnect(error);
    }

    pub fn close(&mut self) {
        self.state = ResumeState::Closed;
    }

    fn disconnect(&mut self, error: Option<&SourceError>) {
        if self.state == ResumeState::Closed {
            return;
        }
        // An expired token is rejected on every retry; start over instead.
        if error.is_some_and(SourceError::is_expired) {
            info!(token = %self.token, "resume token expired, restarting from current state");
            self.token = ResumeToken::empty();
        }
        self.state = ResumeState::Disconnected;
    }
}

/// Keeps one watch stream alive and forwards its objects downstream.
pub struct ResumeDriver<W> {
    name: &'static str,
    watcher: W,
    tracker: ResumeTracker,
    reconnect_delay: Duration,
    state_tx: watch::Sender<ResumeState>,
}

impl<W: Watcher> ResumeDriver<W> {
    pub fn new(name: &'static str, watcher: W, options: WatchOptions) -> Self {
        let (state_tx, _) = watch::channel(ResumeState::Disconnected);
        Self {
            name,
            watcher,
            tracker: ResumeTracker::new(options),
            reconnect_delay: Duration::from_secs(2),
            state_tx,
        }
    }

    /// Fixed wait after a failed connect or a stream error.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ResumeState> {
        self.state_tx.subscribe()
    }

    /// Watch until shutdown or until the downstream queue closes. Returns
    /// the last known resume token.
    pub async fn run(mut self, objects: mpsc::Sender<RawObject>, mut shutdown: watch::Receiver<bool>) -> ResumeToken {
        info!(watcher = self.name, token = %self.tracker.token(), "resume driver started");

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(options) = self.tracker.connect() else {
                break;
            };
            self.publish();

            let connected = tokio::select! {
                _ = shutdown.changed() => break 'outer,
                result = self.watcher.watch(&options) => result,
            };
            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(watcher = self.name, error = %e, "watch connect failed");
                    self.tracker.connect_failed(&e);
                    self.publish();
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            self.tracker.connected();
            self.publish();
            debug!(watcher = self.name, token = %options.resume_token, "watch stream open");

            let failure = loop {
                let item = tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    item = stream.next() => item,
                };
                let event = match item {
                    None => break None,
                    Some(Err(e)) => break Some(e),
                    Some(Ok(event)) => event,
                };
                let Some(object) = self.tracker.on_event(event) else {
                    continue;
                };
                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    sent = objects.send(object) => {
                        if sent.is_err() {
                            debug!(watcher = self.name, "object queue closed");
                            break 'outer;
                        }
                    }
                }
            };

            self.tracker.stream_ended(failure.as_ref());
            self.publish();
            match failure {
                None => debug!(watcher = self.name, token = %self.tracker.token(), "watch stream closed, reconnecting"),
                Some(e) => {
                    warn!(watcher = self.name, error = %e, "watch stream failed");
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.tracker.close();
        self.publish();
        info!(watcher = self.name, token = %self.tracker.token(), "resume driver stopped");
        self.tracker.token().clone()
    }

    /// Sleep the reconnect delay. Returns `false` if shutdown arrived first.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.tracker.state());
    }
}
