use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Broker-side lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        queue: String,
        name: String,
        at: DateTime<Utc>,
    },

    Claimed {
        job_id: JobId,
        attempt: u32,
        visible_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Acked {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        attempt: u32,
        available_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    DeadLettered {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// Claim lapsed without an outcome and was made visible again
    Reclaimed {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Claimed { .. } => "claimed",
            Self::Acked { .. } => "acked",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Reclaimed { .. } => "reclaimed",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Acked { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Reclaimed { job_id, .. } => job_id,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Claimed { at, .. }
            | Self::Acked { at, .. }
            | Self::Retrying { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Reclaimed { at, .. } => at,
        }
    }
}
