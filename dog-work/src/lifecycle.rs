use std::future::Future;
use std::time::Duration;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};

use crate::{pool::RunningPool, QueueError, QueueResult};

/// Outcome of draining a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Workers in the pool
    pub workers: usize,

    /// Workers aborted at the drain deadline; their claims are redelivered
    /// after the visibility timeout
    pub abandoned: usize,

    pub elapsed: Duration,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0
    }
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C only on non-unix)
pub async fn shutdown_signal() -> QueueResult<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .map_err(|e| QueueError::Internal(format!("failed to install Ctrl+C handler: {}", e)))
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| QueueError::Internal(format!("failed to install SIGTERM handler: {}", e)))?
            .recv()
            .await;
        Ok::<(), QueueError>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<QueueResult<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown");
        },
    }

    Ok(())
}

/// Wait for `signal`, then stop claiming and drain the pool.
///
/// With `drain_timeout = None` the drain waits for every in-flight job.
pub async fn run_until<F>(pool: RunningPool, signal: F, drain_timeout: Option<Duration>) -> DrainReport
where
    F: Future<Output = ()>,
{
    signal.await;
    info!(
        drain_timeout_ms = drain_timeout.map(|d| d.as_millis() as u64),
        "Shutdown requested, draining workers"
    );
    pool.drain(drain_timeout).await
}

/// `run_until` with the process termination signals.
///
/// Fails if the signal handlers cannot be installed. The pool is still
/// drained before the error is returned.
pub async fn run_until_signal(pool: RunningPool, drain_timeout: Option<Duration>) -> QueueResult<DrainReport> {
    drain_after(pool, shutdown_signal(), drain_timeout).await
}

async fn drain_after<F>(pool: RunningPool, signal: F, drain_timeout: Option<Duration>) -> QueueResult<DrainReport>
where
    F: Future<Output = QueueResult<()>>,
{
    let mut failure = None;
    let report = run_until(
        pool,
        async {
            if let Err(e) = signal.await {
                failure = Some(e);
            }
        },
        drain_timeout,
    )
    .await;

    match failure {
        Some(e) => {
            error!(error = %e, "Shutdown signal unavailable, pool drained");
            Err(e)
        }
        None => Ok(report),
    }
}
