use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Arguments, JobId};

/// Envelope - the durable record of one job instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Broker-assigned identifier, stable across retries
    pub job_id: JobId,

    name: String,

    /// Queue the envelope lives on
    pub queue: String,

    pub arguments: Arguments,

    /// Zero on first delivery, incremented on each retry
    pub attempt: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Not claimable before this instant
    pub available_at: DateTime<Utc>,

    /// Last failure message (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Envelope {
    /// Create an envelope that is immediately available
    pub fn new(queue: impl Into<String>, name: impl Into<String>, arguments: Arguments) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            name: name.into(),
            queue: queue.into(),
            arguments,
            attempt: 0,
            enqueued_at: now,
            available_at: now,
            last_error: None,
        }
    }

    /// Delay first visibility by `delay`
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.available_at = after(self.enqueued_at, delay);
        self
    }

    /// Name of the handler that executes this job
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }

    /// Envelope for the next attempt after a failure
    pub fn next_attempt(&self, delay: Duration, error: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next.available_at = after(Utc::now(), delay);
        next.last_error = Some(error.into());
        next
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// `at + delay`, saturating at the latest representable instant
pub(crate) fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
