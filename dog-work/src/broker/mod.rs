pub mod client;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::{ClaimToken, ClaimedJob, Envelope, JobEvent, JobId, QueueResult};

pub use client::{BrokerClient, BrokerRetry};
pub use memory::MemoryBroker;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Storage primitives of a durable, claimable queue store.
///
/// A claimed envelope stays invisible to other claimants until it is
/// acked, retried, dead-lettered, or its visibility window lapses.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store an envelope on its queue. Storing an id that is already
    /// present is a no-op success, so a retried enqueue never duplicates.
    async fn enqueue(&self, envelope: Envelope) -> QueueResult<JobId>;

    /// Claim the first available envelope, trying `queues` in order
    async fn claim(&self, queues: &[String], visibility: Duration) -> QueueResult<Option<ClaimedJob>>;

    /// Remove a claimed envelope permanently
    async fn ack(&self, token: &ClaimToken) -> QueueResult<()>;

    /// Re-insert with `attempt + 1`, visible again after `delay`
    async fn retry(&self, token: &ClaimToken, delay: Duration, error: &str) -> QueueResult<()>;

    /// Move to the dead-letter holding area
    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> QueueResult<()>;

    /// Envelopes waiting on `queue` (ready or delayed, not claimed)
    async fn queue_depth(&self, queue: &str) -> QueueResult<usize>;

    /// Dead-lettered envelopes, most recent first
    async fn dead_letters(&self) -> QueueResult<Vec<Envelope>>;

    /// Put a dead envelope back on its queue with a fresh attempt budget
    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<bool>;

    /// Lifecycle events, if the backend publishes them
    fn event_stream(&self) -> BoxStream<JobEvent> {
        Box::pin(futures::stream::empty())
    }

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
