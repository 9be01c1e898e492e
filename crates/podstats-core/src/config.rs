//! podstats.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! daemon that serves `0.0.0.0:8080` for the `default` namespace.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodstatsConfig {
    /// Namespace whose pods are observed.
    pub namespace: String,
    /// Address the scrape endpoint binds to.
    pub listen: String,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
}

/// How pod specifications are fetched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PodSourceMode {
    /// Stream changes with bookmarks and resume after disconnects.
    Watch,
    /// Fetch the full list on every poll tick.
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the API server, e.g. `http://127.0.0.1:8001`.
    pub api_server: Option<String>,
    /// File holding a bearer token.
    pub token_file: Option<PathBuf>,
    /// PEM bundle used to verify the API server certificate.
    pub ca_file: Option<PathBuf>,
    pub label_selector: Option<String>,
    pub pods: PodSourceMode,
    pub poll_interval: String,
    pub reconnect_delay: String,
    /// Server-side watch timeout; unset lets the API server choose.
    pub watch_timeout: Option<String>,
    /// Bound on connecting and reading one API response.
    pub request_timeout: String,
    /// A watch that delivers nothing for this long is dropped and reopened.
    pub watch_idle_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Capacity of each pipeline queue.
    pub queue_capacity: usize,
    /// Drop series not refreshed within this window. Unset keeps every
    /// series until the process exits.
    pub stale_after: Option<String>,
    pub sweep_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: String,
    /// Maximum cached responses; 0 means unbounded.
    pub capacity: usize,
    /// Query key that forces a fresh render.
    pub refresh_key: String,
}

impl Default for PodstatsConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            listen: "0.0.0.0:8080".to_string(),
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token_file: None,
            ca_file: None,
            label_selector: None,
            pods: PodSourceMode::Watch,
            poll_interval: "10s".to_string(),
            reconnect_delay: "2s".to_string(),
            watch_timeout: None,
            request_timeout: "30s".to_string(),
            watch_idle_timeout: "5m".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            stale_after: None,
            sweep_interval: "30s".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: "10s".to_string(),
            capacity: 100,
            refresh_key: "opn".to_string(),
        }
    }
}

impl PodstatsConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PodstatsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every duration string and numeric bound up front so the
    /// daemon fails at startup rather than mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poll_interval()?;
        self.reconnect_delay()?;
        self.watch_timeout()?;
        self.request_timeout()?;
        self.watch_idle_timeout()?;
        self.stale_after()?;
        self.sweep_interval()?;
        self.cache_ttl()?;
        if self.store.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "store.queue_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.cache.refresh_key.is_empty() {
            return Err(ConfigError::Invalid {
                field: "cache.refresh_key",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        required_duration("source.poll_interval", &self.source.poll_interval)
    }

    pub fn reconnect_delay(&self) -> Result<Duration, ConfigError> {
        required_duration("source.reconnect_delay", &self.source.reconnect_delay)
    }

    pub fn watch_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        optional_duration("source.watch_timeout", self.source.watch_timeout.as_deref())
    }

    pub fn request_timeout(&self) -> Result<Duration, ConfigError> {
        required_duration("source.request_timeout", &self.source.request_timeout)
    }

    pub fn watch_idle_timeout(&self) -> Result<Duration, ConfigError> {
        required_duration("source.watch_idle_timeout", &self.source.watch_idle_timeout)
    }

    pub fn stale_after(&self) -> Result<Option<Duration>, ConfigError> {
        optional_duration("store.stale_after", self.store.stale_after.as_deref())
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        required_duration("store.sweep_interval", &self.store.sweep_interval)
    }

    pub fn cache_ttl(&self) -> Result<Duration, ConfigError> {
        required_duration("cache.ttl", &self.cache.ttl)
    }
}

fn required_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
        }),
    }
}

fn optional_duration(field: &'static str, value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value.map(|v| required_duration(field, v)).transpose()
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
