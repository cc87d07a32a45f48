use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Broker-assigned job identifier, stable across retries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Proof of an active claim. Required to ack, retry or dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken {
    job_id: JobId,
    nonce: String,
}

impl ClaimToken {
    /// Mint a fresh token for a claim on `job_id`
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            nonce: Uuid::new_v4().to_string(),
        }
    }

    pub fn from_parts(job_id: JobId, nonce: String) -> Self {
        Self { job_id, nonce }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.nonce)
    }
}
