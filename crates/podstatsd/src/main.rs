//! podstatsd — exports Kubernetes pod requests, limits, and usage.
//!
//! # Usage
//!
//! ```text
//! podstatsd --config /etc/podstats/podstats.toml --namespace prod
//! podstatsd --api-server http://127.0.0.1:8001 --debug
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{oneshot, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use podstats_api::{ResponseCache, ResponseCacheConfig, build_router};
use podstats_core::PodstatsConfig;
use podstats_core::config::PodSourceMode;
use podstats_source::{
    ApiClient, ListOptions, Normalizer, PodLister, PodMetricsLister, PodWatcher, Poller, ResumeDriver, WatchOptions,
};
use podstats_store::{AggregateStore, EvictionPolicy};
use podstatsd::{Pipeline, signal};
use podstatsd::settings::{self, Overrides};

#[derive(Parser)]
#[command(name = "podstatsd", about = "Kubernetes pod resource exporter")]
struct Cli {
    /// Path to podstats.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    /// Human-readable debug logging instead of JSON.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = settings::load(cli.config.as_deref(), cli.overrides)?;
    run(config).await
}

fn init_tracing(debug: bool) {
    let default = if debug { "info,podstats=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if debug {
        builder.init();
    } else {
        builder.json().init();
    }
}

async fn run(config: PodstatsConfig) -> anyhow::Result<()> {
    info!(namespace = %config.namespace, pods = ?config.source.pods, "podstatsd starting");

    let client = ApiClient::new(settings::api_client_config(&config.source)?)?
        .with_request_timeout(config.request_timeout()?);

    let policy = match config.stale_after()? {
        Some(window) => EvictionPolicy::IdleFor(window),
        None => EvictionPolicy::Never,
    };
    let store = AggregateStore::with_policy(policy);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Pipeline ───────────────────────────────────────────────

    let mut pipeline = Pipeline::start(
        store.clone(),
        Normalizer::new()?,
        config.store.queue_capacity,
        config.sweep_interval()?,
        shutdown_rx,
    );

    let poll_interval = config.poll_interval()?;
    let list_options = ListOptions {
        allow_watch_bookmarks: true,
        label_selector: config.source.label_selector.clone(),
    };

    pipeline.spawn_poller(
        Poller::new("pod-metrics", PodMetricsLister::new(client.clone(), &config.namespace))
            .with_interval(poll_interval)
            .with_options(list_options.clone()),
    );

    match config.source.pods {
        PodSourceMode::List => pipeline.spawn_poller(
            Poller::new("pods", PodLister::new(client, &config.namespace))
                .with_interval(poll_interval)
                .with_options(list_options),
        ),
        PodSourceMode::Watch => {
            let options = WatchOptions {
                allow_watch_bookmarks: true,
                label_selector: config.source.label_selector.clone(),
                timeout: config.watch_timeout()?,
                ..Default::default()
            };
            let watcher =
                PodWatcher::new(client, &config.namespace).with_idle_timeout(config.watch_idle_timeout()?);
            let driver =
                ResumeDriver::new("pods", watcher, options).with_reconnect_delay(config.reconnect_delay()?);
            pipeline.spawn_watcher("pods", driver);
        }
    }

    // ── Scrape endpoint ────────────────────────────────────────

    let cache = if config.cache.enabled {
        Some(ResponseCache::new(ResponseCacheConfig {
            ttl: config.cache_ttl()?,
            max_entries: config.cache.capacity,
            refresh_key: config.cache.refresh_key.clone(),
        }))
    } else {
        None
    };
    let router = build_router(store, cache.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "scrape endpoint listening");

    // Graceful shutdown on Ctrl-C. A handler that cannot be installed also
    // stops the server, and `run` then fails.
    let (signal_tx, signal_rx) = oneshot::channel();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let result = signal::wait_for_signal(tokio::signal::ctrl_c(), &shutdown_tx).await;
            let _ = signal_tx.send(result);
        })
        .await?;

    pipeline.join().await;

    if let Some(cache) = &cache {
        let (hits, misses, evictions) = cache.stats();
        info!(hits, misses, evictions, entries = cache.len(), "response cache stats");
    }

    if let Ok(Err(e)) = signal_rx.await {
        return Err(e).context("failed to listen for Ctrl-C");
    }

    info!("podstatsd stopped");
    Ok(())
}
