//! Domain types shared by connectors, the normalizer, and the store.

use std::collections::BTreeMap;
use std::fmt;

use crate::quantity::Quantity;

// ── Readings ───────────────────────────────────────────────────────

/// How a reading combines with the value already stored under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    /// New value is added to the stored value.
    Counter,
    /// New value replaces the stored value.
    Instant,
}

/// A single named, labeled numeric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Metric name plus rendered label set, e.g. `ps_cpu_usage_cores{pod_name="a"}`.
    pub key: String,
    pub value: f64,
    /// Epoch milliseconds, carried opaquely.
    pub time: String,
    pub kind: ReadingKind,
}

impl Reading {
    pub fn new(key: impl Into<String>, value: f64, time: impl Into<String>, kind: ReadingKind) -> Self {
        Self {
            key: key.into(),
            value,
            time: time.into(),
            kind,
        }
    }
}

/// Every series the normalizer emits.
///
/// The merge kind belongs to the metric, so two readings with the same key
/// can never disagree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    MemoryRequest,
    MemoryLimit,
    CpuRequest,
    CpuLimit,
    StorageRequest,
    StorageLimit,
    MemoryUsage,
    CpuUsage,
    StorageUsage,
}

impl Metric {
    /// Series derived from a workload's declared requests and limits.
    pub const SPEC: [Metric; 6] = [
        Metric::MemoryRequest,
        Metric::MemoryLimit,
        Metric::CpuRequest,
        Metric::CpuLimit,
        Metric::StorageRequest,
        Metric::StorageLimit,
    ];

    /// Series derived from observed usage samples.
    pub const USAGE: [Metric; 3] = [Metric::MemoryUsage, Metric::CpuUsage, Metric::StorageUsage];

    pub fn name(self) -> &'static str {
        match self {
            Metric::MemoryRequest => "ps_memory_request_bytes",
            Metric::MemoryLimit => "ps_memory_limit_bytes",
            Metric::CpuRequest => "ps_cpu_request_cores",
            Metric::CpuLimit => "ps_cpu_limit_cores",
            Metric::StorageRequest => "ps_storage_request_bytes",
            Metric::StorageLimit => "ps_storage_limit_bytes",
            Metric::MemoryUsage => "ps_memory_usage_bytes",
            Metric::CpuUsage => "ps_cpu_usage_cores",
            Metric::StorageUsage => "ps_storage_usage_bytes",
        }
    }

    pub fn kind(self) -> ReadingKind {
        ReadingKind::Instant
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Raw objects ────────────────────────────────────────────────────

/// An object fetched from the control plane, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawObject {
    Spec(WorkloadSpecSnapshot),
    Usage(UsageSnapshot),
}

impl RawObject {
    /// Name of the workload this object describes.
    pub fn name(&self) -> &str {
        match self {
            RawObject::Spec(spec) => &spec.name,
            RawObject::Usage(usage) => &usage.name,
        }
    }
}

/// Declared resources for every container of one workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadSpecSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Creation time, epoch milliseconds.
    pub created_at_ms: i64,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub requests: ResourceList,
    pub limits: ResourceList,
}

/// Observed consumption for every container of one workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Sample time, epoch milliseconds.
    pub timestamp_ms: i64,
    pub containers: Vec<ContainerUsage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerUsage {
    pub name: String,
    pub usage: ResourceList,
}

/// The resource dimensions podstats tracks. Missing entries read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceList {
    pub memory: Option<Quantity>,
    pub cpu: Option<Quantity>,
    pub ephemeral_storage: Option<Quantity>,
}

impl ResourceList {
    pub fn memory(&self) -> Quantity {
        self.memory.unwrap_or_default()
    }

    pub fn cpu(&self) -> Quantity {
        self.cpu.unwrap_or_default()
    }

    pub fn ephemeral_storage(&self) -> Quantity {
        self.ephemeral_storage.unwrap_or_default()
    }
}

// ── Resumption ─────────────────────────────────────────────────────

/// Opaque continuation marker issued by a watched source.
///
/// An empty token means "start from the current state".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResumeToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for ResumeToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
