//! Startup configuration: TOML file, then command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use tracing::info;

use podstats_core::PodstatsConfig;
use podstats_core::config::SourceConfig;
use podstats_source::ApiClientConfig;

/// Flags that take precedence over the configuration file.
#[derive(Debug, Default, Args)]
pub struct Overrides {
    /// Namespace whose pods are observed.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Address for the scrape endpoint, e.g. 0.0.0.0:8080.
    #[arg(long)]
    pub listen: Option<String>,

    /// API server base URL, e.g. http://127.0.0.1:8001.
    #[arg(long)]
    pub api_server: Option<String>,

    /// File holding a bearer token for the API server.
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// PEM bundle used to verify the API server certificate.
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// Only observe pods matching this label selector.
    #[arg(long)]
    pub label_selector: Option<String>,
}

impl Overrides {
    pub fn apply(self, config: &mut PodstatsConfig) {
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(api_server) = self.api_server {
            config.source.api_server = Some(api_server);
        }
        if let Some(token_file) = self.token_file {
            config.source.token_file = Some(token_file);
        }
        if let Some(ca_file) = self.ca_file {
            config.source.ca_file = Some(ca_file);
        }
        if let Some(selector) = self.label_selector {
            config.source.label_selector = Some(selector);
        }
    }
}

/// Load the configuration file (if any), apply overrides, and validate.
pub fn load(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<PodstatsConfig> {
    let mut config = match path {
        Some(path) => {
            let config = PodstatsConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => PodstatsConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Resolve how to reach the API server: explicit settings first, then the
/// in-cluster service account.
pub fn api_client_config(source: &SourceConfig) -> anyhow::Result<ApiClientConfig> {
    let Some(server) = &source.api_server else {
        let config = ApiClientConfig::in_cluster()?
            .context("no API server configured; pass --api-server or run inside a cluster")?;
        info!(api_server = %config.api_server, "using in-cluster service account");
        return Ok(config);
    };

    let mut config = ApiClientConfig::new(server.clone());
    if let Some(path) = &source.token_file {
        config = config.with_token_file(path)?;
    }
    if let Some(path) = &source.ca_file {
        config = config.with_ca_file(path)?;
    }
    Ok(config)
}
