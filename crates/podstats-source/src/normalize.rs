//! Normalizer — turns raw objects into keyed readings.
//!
//! Workload snapshots yield six readings per container (request and limit for
//! memory, cpu and ephemeral storage); usage snapshots yield three.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use podstats_core::{Metric, Quantity, RawObject, Reading, ResourceList};

/// Rewrites arbitrary label names into `[A-Za-z0-9_]` with no leading
/// underscore.
#[derive(Debug, Clone)]
pub struct LabelSanitizer {
    invalid: Regex,
    leading: Regex,
}

impl LabelSanitizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            invalid: Regex::new(r"[^a-zA-Z0-9_]")?,
            leading: Regex::new(r"^_+")?,
        })
    }

    pub fn sanitize(&self, name: &str) -> String {
        let replaced = self.invalid.replace_all(name, "_");
        self.leading.replace(&replaced, "").into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    sanitizer: LabelSanitizer,
}

impl Normalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            sanitizer: LabelSanitizer::new()?,
        })
    }

    pub fn sanitizer(&self) -> &LabelSanitizer {
        &self.sanitizer
    }

    /// Render `{name="value", ...}`: workload labels in name order, then
    /// `extras` in the order given. Values are inserted verbatim, and a
    /// name with no valid characters left renders as an empty name.
    pub fn render_labels(&self, labels: &BTreeMap<String, String>, extras: &[(&str, &str)]) -> String {
        let pairs = labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(extras.iter().copied());

        let mut out = String::from("{");
        for (i, (name, value)) in pairs.enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            // Writing into a String cannot fail.
            let _ = write!(out, "{}=\"{}\"", self.sanitizer.sanitize(name), value);
        }
        out.push('}');
        out
    }

    /// Map one raw object to its readings.
    pub fn normalize(&self, object: RawObject) -> Vec<Reading> {
        match object {
            RawObject::Spec(spec) => {
                let time = spec.created_at_ms.to_string();
                let mut readings = Vec::with_capacity(spec.containers.len() * Metric::SPEC.len());
                for container in &spec.containers {
                    let labels = self.render_labels(
                        &spec.labels,
                        &[("pod-name", spec.name.as_str()), ("container-name", container.name.as_str())],
                    );
                    for metric in Metric::SPEC {
                        let quantity = match metric {
                            Metric::MemoryRequest => container.requests.memory(),
                            Metric::MemoryLimit => container.limits.memory(),
                            Metric::CpuRequest => container.requests.cpu(),
                            Metric::CpuLimit => container.limits.cpu(),
                            Metric::StorageRequest => container.requests.ephemeral_storage(),
                            _ => container.limits.ephemeral_storage(),
                        };
                        readings.push(reading(metric, &labels, quantity, &time));
                    }
                }
                readings
            }
            RawObject::Usage(usage) => {
                let time = usage.timestamp_ms.to_string();
                let mut readings = Vec::with_capacity(usage.containers.len() * Metric::USAGE.len());
                for container in &usage.containers {
                    let labels = self.render_labels(
                        &usage.labels,
                        &[("pod-name", usage.name.as_str()), ("container-name", container.name.as_str())],
                    );
                    for metric in Metric::USAGE {
                        readings.push(reading(metric, &labels, usage_quantity(metric, &container.usage), &time));
                    }
                }
                readings
            }
        }
    }

    /// Normalize objects until shutdown or until either queue closes.
    pub async fn run(
        self,
        mut objects: mpsc::Receiver<RawObject>,
        readings: mpsc::Sender<Reading>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("normalizer started");
        loop {
            let object = tokio::select! {
                _ = shutdown.changed() => break,
                next = objects.recv() => match next {
                    Some(object) => object,
                    None => {
                        debug!("object queue closed");
                        break;
                    }
                },
            };
            let name = object.name().to_string();
            let batch = self.normalize(object);
            debug!(object = %name, readings = batch.len(), "normalized object");

            for item in batch {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("normalizer shutting down");
                        return;
                    }
                    sent = readings.send(item) => {
                        if sent.is_err() {
                            debug!("reading queue closed");
                            return;
                        }
                    }
                }
            }
        }
        info!("normalizer shutting down");
    }
}

fn usage_quantity(metric: Metric, usage: &ResourceList) -> Quantity {
    match metric {
        Metric::MemoryUsage => usage.memory(),
        Metric::CpuUsage => usage.cpu(),
        _ => usage.ephemeral_storage(),
    }
}

fn reading(metric: Metric, labels: &str, quantity: Quantity, time: &str) -> Reading {
    Reading::new(format!("{}{}", metric.name(), labels), quantity.as_f64(), time, metric.kind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use podstats_core::{ContainerSpec, ContainerUsage, ReadingKind, UsageSnapshot, WorkloadSpecSnapshot};

    fn normalizer() -> Normalizer {
        Normalizer::new().unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn q(s: &str) -> Option<Quantity> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn sanitize_examples() {
        let s = LabelSanitizer::new().unwrap();
        assert_eq!(s.sanitize("app"), "app");
        assert_eq!(s.sanitize("app.kubernetes.io/name"), "app_kubernetes_io_name");
        assert_eq!(s.sanitize("pod-name"), "pod_name");
        assert_eq!(s.sanitize("__private"), "private");
        assert_eq!(s.sanitize("-x"), "x");
        assert_eq!(s.sanitize("a__b_"), "a__b_");
        assert_eq!(s.sanitize("ünï"), "n_");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let s = LabelSanitizer::new().unwrap();
        let names = [
            "app",
            "app.kubernetes.io/name",
            "__x__",
            "-_-a",
            "9lives",
            "tier-1",
            "ünïcode",
            "a b\tc",
            "___",
            "",
        ];
        for name in names {
            let once = s.sanitize(name);
            assert_eq!(s.sanitize(&once), once, "{name:?}");
        }
    }

    /// Deterministic label maps drawn from awkward names and values.
    fn generated_label_maps() -> Vec<BTreeMap<String, String>> {
        let names = [
            "app",
            "app.kubernetes.io/name",
            "_leading",
            "9lives",
            "tier-1",
            "ünïcode",
            "x__",
            "helm.sh/chart",
        ];
        let values = ["", "web", "v1.2.3", "a b", "δ"];
        let mut maps = Vec::new();
        for mask in 0u32..(1 << names.len()) {
            let map = names
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(i, name)| (name.to_string(), values[(i + mask as usize) % values.len()].to_string()))
                .collect();
            maps.push(map);
        }
        maps
    }

    #[test]
    fn rendered_labels_are_well_formed() {
        let n = normalizer();
        for map in generated_label_maps() {
            let rendered = n.render_labels(&map, &[("pod-name", "p"), ("container-name", "c")]);
            assert!(rendered.starts_with('{') && rendered.ends_with('}'), "{rendered}");

            let inner = &rendered[1..rendered.len() - 1];
            let pairs: Vec<&str> = inner.split(", ").collect();
            assert_eq!(pairs.len(), map.len() + 2, "{rendered}");

            let expected: Vec<(String, &str)> = map
                .iter()
                .map(|(k, v)| (n.sanitizer().sanitize(k), v.as_str()))
                .chain([("pod_name".to_string(), "p"), ("container_name".to_string(), "c")])
                .collect();
            for (pair, (name, value)) in pairs.iter().zip(&expected) {
                let (got_name, got_value) = pair.split_once('=').unwrap();
                assert!(!got_name.is_empty() && !got_name.starts_with('_'), "{rendered}");
                assert!(got_name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'), "{rendered}");
                assert_eq!(got_name, name);
                assert_eq!(got_value, format!("\"{value}\""));
            }
        }
    }

    #[test]
    fn name_without_valid_characters_renders_empty() {
        let n = normalizer();
        let rendered = n.render_labels(&labels(&[("___", "x"), ("-/.", "y")]), &[]);
        assert_eq!(rendered, "{=\"y\", =\"x\"}");
    }

    #[test]
    fn empty_label_map_still_braced() {
        assert_eq!(normalizer().render_labels(&BTreeMap::new(), &[]), "{}");
    }

    #[test]
    fn spec_snapshot_yields_six_readings_per_container() {
        let spec = WorkloadSpecSnapshot {
            name: "web-1".to_string(),
            labels: labels(&[("app", "web")]),
            created_at_ms: 1_700_000_000_000,
            containers: vec![
                ContainerSpec {
                    name: "nginx".to_string(),
                    requests: ResourceList {
                        memory: q("64Mi"),
                        cpu: q("250m"),
                        ephemeral_storage: None,
                    },
                    limits: ResourceList {
                        memory: q("128Mi"),
                        cpu: q("1"),
                        ephemeral_storage: q("2Gi"),
                    },
                },
                ContainerSpec {
                    name: "sidecar".to_string(),
                    ..Default::default()
                },
            ],
        };

        let readings = normalizer().normalize(RawObject::Spec(spec));
        assert_eq!(readings.len(), 12);
        assert!(readings.iter().all(|r| r.time == "1700000000000" && r.kind == ReadingKind::Instant));

        let find = |key: &str| readings.iter().find(|r| r.key == key).unwrap().value;
        let nginx = "{app=\"web\", pod_name=\"web-1\", container_name=\"nginx\"}";
        assert_eq!(find(&format!("ps_memory_request_bytes{nginx}")), 67_108_864.0);
        assert_eq!(find(&format!("ps_memory_limit_bytes{nginx}")), 134_217_728.0);
        assert_eq!(find(&format!("ps_cpu_request_cores{nginx}")), 0.25);
        assert_eq!(find(&format!("ps_cpu_limit_cores{nginx}")), 1.0);
        assert_eq!(find(&format!("ps_storage_request_bytes{nginx}")), 0.0);
        assert_eq!(find(&format!("ps_storage_limit_bytes{nginx}")), 2_147_483_648.0);

        let sidecar = "{app=\"web\", pod_name=\"web-1\", container_name=\"sidecar\"}";
        assert_eq!(find(&format!("ps_cpu_limit_cores{sidecar}")), 0.0);
    }

    #[test]
    fn usage_snapshot_yields_three_readings_per_container() {
        let usage = UsageSnapshot {
            name: "web-1".to_string(),
            labels: BTreeMap::new(),
            timestamp_ms: 42_000,
            containers: vec![ContainerUsage {
                name: "nginx".to_string(),
                usage: ResourceList {
                    memory: q("1342177280e-1"),
                    cpu: q("1500000n"),
                    ephemeral_storage: None,
                },
            }],
        };

        let readings = normalizer().normalize(RawObject::Usage(usage));
        assert_eq!(readings.len(), 3);

        let labels = "{pod_name=\"web-1\", container_name=\"nginx\"}";
        let memory = readings
            .iter()
            .find(|r| r.key == format!("ps_memory_usage_bytes{labels}"))
            .unwrap();
        assert!((memory.value - 134_217_728.0).abs() <= 134_217_728.0 * 1e-9);
        assert_eq!(memory.time, "42000");

        let cpu = readings.iter().find(|r| r.key.starts_with("ps_cpu_usage_cores")).unwrap();
        assert!((cpu.value - 0.0015).abs() <= 0.0015 * 1e-9);
        assert!(readings.iter().any(|r| r.key.starts_with("ps_storage_usage_bytes") && r.value == 0.0));
    }

    #[test]
    fn workload_without_containers_yields_nothing() {
        let spec = WorkloadSpecSnapshot {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(normalizer().normalize(RawObject::Spec(spec)).is_empty());
    }

    #[tokio::test]
    async fn run_forwards_readings_in_order() {
        let (obj_tx, obj_rx) = mpsc::channel(4);
        let (read_tx, mut read_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(normalizer().run(obj_rx, read_tx, shutdown_rx));

        let usage = |name: &str| {
            RawObject::Usage(UsageSnapshot {
                name: name.to_string(),
                containers: vec![ContainerUsage {
                    name: "c".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            })
        };
        obj_tx.send(usage("a")).await.unwrap();
        obj_tx.send(usage("b")).await.unwrap();
        drop(obj_tx);
        handle.await.unwrap();

        let mut keys = Vec::new();
        while let Some(r) = read_rx.recv().await {
            keys.push(r.key);
        }
        assert_eq!(keys.len(), 6);
        assert!(keys[..3].iter().all(|k| k.contains("pod_name=\"a\"")));
        assert!(keys[3..].iter().all(|k| k.contains("pod_name=\"b\"")));
    }
}
