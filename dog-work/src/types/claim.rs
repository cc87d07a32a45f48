use chrono::{DateTime, Utc};

use super::{ClaimToken, Envelope, JobId};

/// An envelope claimed by one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub envelope: Envelope,

    /// Token for ack / retry / dead-letter
    pub token: ClaimToken,

    /// Redelivered to another claimant after this instant
    pub visible_until: DateTime<Utc>,
}

impl ClaimedJob {
    pub fn new(envelope: Envelope, token: ClaimToken, visible_until: DateTime<Utc>) -> Self {
        Self {
            envelope,
            token,
            visible_until,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.envelope.job_id
    }
}
