//! Shutdown signal handling.

use std::future::Future;
use std::io;

use tokio::sync::watch;
use tracing::{error, info};

/// Wait for `signal`, then raise the shutdown flag.
///
/// The flag is raised even when the signal handler could not be installed;
/// the error is returned so the caller can exit non-zero after draining.
pub async fn wait_for_signal<F>(signal: F, shutdown: &watch::Sender<bool>) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let result = signal.await;
    match &result {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to install signal handler"),
    }
    let _ = shutdown.send(true);
    result
}
