use std::sync::Arc;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{broker::BoxStream, JobEvent};

/// Install a global `tracing` subscriber honouring `RUST_LOG`.
///
/// Defaults to `info` when `RUST_LOG` is unset. Calling it twice is a no-op.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };

    if result.is_err() {
        debug!("Tracing subscriber already installed");
    }
}

/// Running totals of broker lifecycle events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub enqueued: u64,
    pub claimed: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub reclaimed: u64,
}

impl JobCounters {
    pub fn record(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Enqueued { .. } => self.enqueued += 1,
            JobEvent::Claimed { .. } => self.claimed += 1,
            JobEvent::Acked { .. } => self.acked += 1,
            JobEvent::Retrying { .. } => self.retried += 1,
            JobEvent::DeadLettered { .. } => self.dead_lettered += 1,
            JobEvent::Reclaimed { .. } => self.reclaimed += 1,
        }
    }
}

/// Consume an event stream in the background, logging each event at debug
/// level and keeping counters current
pub fn watch_events(mut events: BoxStream<JobEvent>) -> (Arc<RwLock<JobCounters>>, JoinHandle<()>) {
    let counters = Arc::new(RwLock::new(JobCounters::default()));
    let shared = counters.clone();

    let handle = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            debug!(
                event = event.event_name(),
                job_id = %event.job_id(),
                at = %event.timestamp(),
                "Job event"
            );
            shared.write().record(&event);
        }
    });

    (counters, handle)
}
