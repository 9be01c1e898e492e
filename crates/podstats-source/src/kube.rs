//! Kubernetes REST connectors: pod lists, pod metrics lists, pod watches.
//!
//! Only the fields podstats reads are modelled; everything else in the
//! API objects is ignored during decoding.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use podstats_core::{
    ContainerSpec, ContainerUsage, Quantity, RawObject, ResourceList, UsageSnapshot, WorkloadSpecSnapshot,
};

use crate::client::ApiClient;
use crate::connector::{ListOptions, Lister, ResumeMarker, WatchEvent, WatchOptions, WatchStream, Watcher};
use crate::error::SourceError;

const WATCH_BUFFER: usize = 64;
/// Bookmarks arrive about once a minute, so this much silence means the
/// connection is gone.
const DEFAULT_WATCH_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Longest watch line accepted before the stream is abandoned.
const MAX_WATCH_LINE: usize = 4 << 20;

// ── Wire models ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ObjectMeta {
    name: String,
    labels: Option<BTreeMap<String, String>>,
    creation_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodSpec {
    containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Container {
    name: String,
    resources: ResourceRequirements,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourceRequirements {
    requests: Option<ResourceMap>,
    limits: Option<ResourceMap>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourceMap {
    memory: Option<Quantity>,
    cpu: Option<Quantity>,
    #[serde(rename = "ephemeral-storage")]
    ephemeral_storage: Option<Quantity>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct PodMetrics {
    #[serde(default)]
    metadata: ObjectMeta,
    timestamp: Option<String>,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    #[serde(default)]
    name: String,
    #[serde(default)]
    usage: ResourceMap,
}

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetrics>,
}

/// One newline-delimited watch event.
#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

/// Body of an `ERROR` watch event.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Status {
    code: u16,
    message: String,
}

// ── Conversions ────────────────────────────────────────────────────

impl From<ResourceMap> for ResourceList {
    fn from(map: ResourceMap) -> Self {
        ResourceList {
            memory: map.memory,
            cpu: map.cpu,
            ephemeral_storage: map.ephemeral_storage,
        }
    }
}

/// RFC 3339 timestamp to epoch milliseconds at whole-second precision.
/// A missing timestamp reads as zero.
fn epoch_millis(field: &str, value: Option<&str>) -> Result<i64, SourceError> {
    let Some(value) = value else {
        return Ok(0);
    };
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| SourceError::Decode(format!("{field} {value:?}: {e}")))?;
    Ok(parsed.timestamp() * 1000)
}

fn pod_to_raw(pod: Pod) -> Result<RawObject, SourceError> {
    let created_at_ms = epoch_millis("creationTimestamp", pod.metadata.creation_timestamp.as_deref())?;
    let containers = pod
        .spec
        .containers
        .into_iter()
        .map(|c| ContainerSpec {
            name: c.name,
            requests: c.resources.requests.map(ResourceList::from).unwrap_or_default(),
            limits: c.resources.limits.map(ResourceList::from).unwrap_or_default(),
        })
        .collect();
    Ok(RawObject::Spec(WorkloadSpecSnapshot {
        name: pod.metadata.name,
        labels: pod.metadata.labels.unwrap_or_default(),
        created_at_ms,
        containers,
    }))
}

fn metrics_to_raw(metrics: PodMetrics) -> Result<RawObject, SourceError> {
    let timestamp_ms = epoch_millis("timestamp", metrics.timestamp.as_deref())?;
    let containers = metrics
        .containers
        .into_iter()
        .map(|c| ContainerUsage {
            name: c.name,
            usage: c.usage.into(),
        })
        .collect();
    Ok(RawObject::Usage(UsageSnapshot {
        name: metrics.metadata.name,
        labels: metrics.metadata.labels.unwrap_or_default(),
        timestamp_ms,
        containers,
    }))
}

/// Decode one line of a pod watch stream. Blank lines yield `None`.
fn decode_watch_line(line: &[u8]) -> Option<Result<WatchEvent, SourceError>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let event: WatchLine = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(e) => return Some(Err(SourceError::Decode(format!("watch event: {e}")))),
    };
    let decoded = match event.kind.as_str() {
        "ADDED" | "MODIFIED" | "DELETED" => serde_json::from_value::<Pod>(event.object)
            .map_err(|e| SourceError::Decode(format!("watched pod: {e}")))
            .and_then(pod_to_raw)
            .map(WatchEvent::Object),
        "BOOKMARK" => Ok(WatchEvent::Marker(ResumeMarker::new(event.object))),
        "ERROR" => {
            let status: Status = serde_json::from_value(event.object).unwrap_or_default();
            if status.code == 410 {
                Err(SourceError::Expired(status.message))
            } else {
                Err(SourceError::Status {
                    path: "watch".to_string(),
                    status: status.code,
                    message: status.message,
                })
            }
        }
        other => Err(SourceError::Decode(format!("unknown watch event type {other:?}"))),
    };
    Some(decoded)
}

// ── Paths ──────────────────────────────────────────────────────────

fn pods_path(namespace: &str) -> String {
    format!("/api/v1/namespaces/{}/pods", urlencoding::encode(namespace))
}

fn pod_metrics_path(namespace: &str) -> String {
    format!("/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods", urlencoding::encode(namespace))
}

fn with_query(path: String, pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return path;
    }
    let query: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect();
    format!("{path}?{}", query.join("&"))
}

fn list_query(options: &ListOptions) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(selector) = &options.label_selector {
        pairs.push(("labelSelector", selector.clone()));
    }
    pairs
}

fn watch_query(options: &WatchOptions) -> Vec<(&'static str, String)> {
    let mut pairs = vec![("watch", "true".to_string())];
    if options.allow_watch_bookmarks {
        pairs.push(("allowWatchBookmarks", "true".to_string()));
    }
    if !options.resume_token.is_empty() {
        pairs.push(("resourceVersion", options.resume_token.as_str().to_string()));
    }
    if let Some(selector) = &options.label_selector {
        pairs.push(("labelSelector", selector.clone()));
    }
    if let Some(timeout) = options.timeout {
        pairs.push(("timeoutSeconds", timeout.as_secs().max(1).to_string()));
    }
    pairs
}

// ── Connectors ─────────────────────────────────────────────────────

/// Lists pod specifications in one namespace.
#[derive(Clone)]
pub struct PodLister {
    client: ApiClient,
    namespace: String,
}

impl PodLister {
    pub fn new(client: ApiClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl Lister for PodLister {
    async fn list(&self, options: &ListOptions) -> Result<Vec<RawObject>, SourceError> {
        let path = with_query(pods_path(&self.namespace), &list_query(options));
        let list: PodList = self.client.get_json(&path).await?;
        list.items.into_iter().map(pod_to_raw).collect()
    }
}

/// Lists pod usage samples from the metrics API in one namespace.
#[derive(Clone)]
pub struct PodMetricsLister {
    client: ApiClient,
    namespace: String,
}

impl PodMetricsLister {
    pub fn new(client: ApiClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl Lister for PodMetricsLister {
    async fn list(&self, options: &ListOptions) -> Result<Vec<RawObject>, SourceError> {
        let path = with_query(pod_metrics_path(&self.namespace), &list_query(options));
        let list: PodMetricsList = self.client.get_json(&path).await?;
        list.items.into_iter().map(metrics_to_raw).collect()
    }
}

/// Watches pod specifications in one namespace.
#[derive(Clone)]
pub struct PodWatcher {
    client: ApiClient,
    namespace: String,
    idle_timeout: Duration,
}

impl PodWatcher {
    pub fn new(client: ApiClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            idle_timeout: DEFAULT_WATCH_IDLE_TIMEOUT,
        }
    }

    /// End the stream with an error when no data arrives for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Watcher for PodWatcher {
    async fn watch(&self, options: &WatchOptions) -> Result<WatchStream, SourceError> {
        let path = with_query(pods_path(&self.namespace), &watch_query(options));
        let resp = self.client.get(&path).await?;
        let (tx, stream) = WatchStream::channel(WATCH_BUFFER);
        tokio::spawn(pump_watch_body(resp.into_body(), tx, self.idle_timeout));
        Ok(stream)
    }
}

/// Split a streaming response body into watch events until the body ends,
/// an error event arrives, the body goes quiet for `idle`, or the receiving
/// stream is dropped.
async fn pump_watch_body(
    mut body: Incoming,
    tx: mpsc::Sender<Result<WatchEvent, SourceError>>,
    idle: Duration,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                debug!("watch stream dropped, releasing response body");
                return;
            }
            frame = tokio::time::timeout(idle, body.frame()) => frame,
        };
        let Ok(frame) = frame else {
            warn!(?idle, "watch stream idle, dropping connection");
            let _ = tx
                .send(Err(SourceError::Timeout {
                    what: "watch stream".to_string(),
                    after: idle,
                }))
                .await;
            return;
        };
        match frame {
            None => {
                if let Some(item) = decode_watch_line(&buf) {
                    let _ = tx.send(item).await;
                }
                return;
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(SourceError::Http(e.to_string()))).await;
                return;
            }
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if !forward_lines(&mut buf, data, &tx).await {
                    return;
                }
            }
        }
    }
}

/// Append `data` and forward every complete line. Returns `false` once
/// the stream should stop.
async fn forward_lines(
    buf: &mut Vec<u8>,
    data: Bytes,
    tx: &mpsc::Sender<Result<WatchEvent, SourceError>>,
) -> bool {
    buf.extend_from_slice(&data);
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let Some(item) = decode_watch_line(&line) else {
            continue;
        };
        let fatal = item.is_err();
        if let Err(e) = &item {
            warn!(error = %e, "watch stream reported an error");
        }
        if tx.send(item).await.is_err() || fatal {
            return false;
        }
    }
    if buf.len() > MAX_WATCH_LINE {
        let err = SourceError::Decode(format!("watch line exceeds {MAX_WATCH_LINE} bytes"));
        warn!(error = %err, "abandoning watch stream");
        let _ = tx.send(Err(err)).await;
        buf.clear();
        return false;
    }
    true
}
