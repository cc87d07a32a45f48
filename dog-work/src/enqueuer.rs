use std::time::Duration;
use tracing::{info, instrument};

use crate::{Arguments, BrokerClient, JobId, QueueResult};

/// Producer bound to one queue
#[derive(Clone)]
pub struct Enqueuer {
    client: BrokerClient,
    queue: String,
}

impl Enqueuer {
    pub fn new(client: BrokerClient, queue: impl Into<String>) -> Self {
        Self {
            client,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Enqueue `job_name` for immediate execution
    #[instrument(skip(self, arguments), fields(queue = %self.queue))]
    pub async fn enqueue(&self, job_name: &str, arguments: Arguments) -> QueueResult<JobId> {
        let job_id = self.client.enqueue(&self.queue, job_name, arguments).await?;
        info!(job_id = %job_id, "Enqueued job");
        Ok(job_id)
    }

    /// Enqueue `job_name` to run no earlier than `delay` from now
    #[instrument(skip(self, arguments), fields(queue = %self.queue))]
    pub async fn enqueue_in(&self, job_name: &str, arguments: Arguments, delay: Duration) -> QueueResult<JobId> {
        let job_id = self.client.enqueue_in(&self.queue, job_name, arguments, delay).await?;
        info!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "Scheduled job");
        Ok(job_id)
    }
}
