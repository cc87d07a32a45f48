use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::{
    QueueResult, JobId, Envelope, Arguments, ClaimedJob, ClaimToken, JobEvent,
    broker::{Broker, BoxStream},
};

/// Backoff for transient broker failures
#[derive(Debug, Clone)]
pub struct BrokerRetry {
    /// Total tries per operation, including the first
    pub max_attempts: u32,

    pub initial_delay: Duration,

    pub max_delay: Duration,

    /// Scale each delay by a random factor in [0.5, 1.0]
    pub use_jitter: bool,
}

impl BrokerRetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Fail on the first error
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Delay before try number `attempt + 1` (attempt starts at 1)
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);

        if self.use_jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

impl Default for BrokerRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            use_jitter: true,
        }
    }
}

/// Broker handle used by enqueuers and workers.
///
/// Wraps a [`Broker`] with retry on transient failures, the idle poll
/// interval, and the claim visibility timeout.
#[derive(Clone)]
pub struct BrokerClient {
    broker: Arc<dyn Broker>,
    retry: BrokerRetry,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl BrokerClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            retry: BrokerRetry::default(),
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_retry(mut self, retry: BrokerRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn retrying<T, F, Fut>(&self, op: &'static str, mut operation: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "Broker operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        op,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(op, attempts = attempt, error = %e, "Broker unavailable, giving up");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Enqueue a job for immediate execution
    #[instrument(skip_all, fields(queue = %queue.as_ref(), job_name = %name.as_ref()))]
    pub async fn enqueue(
        &self,
        queue: impl AsRef<str>,
        name: impl AsRef<str>,
        arguments: Arguments,
    ) -> QueueResult<JobId> {
        self.enqueue_envelope(Envelope::new(queue.as_ref(), name.as_ref(), arguments)).await
    }

    /// Enqueue a job that becomes claimable after `delay`
    pub async fn enqueue_in(
        &self,
        queue: impl AsRef<str>,
        name: impl AsRef<str>,
        arguments: Arguments,
        delay: Duration,
    ) -> QueueResult<JobId> {
        let envelope = Envelope::new(queue.as_ref(), name.as_ref(), arguments).delayed(delay);
        self.enqueue_envelope(envelope).await
    }

    /// Enqueue a prepared envelope.
    ///
    /// Safe to retry: a broker that already stored the id reports success.
    pub async fn enqueue_envelope(&self, envelope: Envelope) -> QueueResult<JobId> {
        envelope.arguments.validate()?;

        let broker = self.broker.clone();
        self.retrying("enqueue", move || {
            let broker = broker.clone();
            let envelope = envelope.clone();
            async move { broker.enqueue(envelope).await }
        })
        .await
    }

    /// Claim one envelope from `queues`.
    ///
    /// Makes a single claim attempt. When nothing is available, waits up to
    /// the poll interval (or until shutdown is signalled) and returns `None`.
    pub async fn claim_next(
        &self,
        queues: &[String],
        shutdown: &mut watch::Receiver<bool>,
    ) -> QueueResult<Option<ClaimedJob>> {
        if *shutdown.borrow() {
            return Ok(None);
        }

        let broker = self.broker.clone();
        let visibility = self.visibility_timeout;
        let claimed = self
            .retrying("claim", move || {
                let broker = broker.clone();
                let queues = queues.to_vec();
                async move { broker.claim(&queues, visibility).await }
            })
            .await?;

        if claimed.is_some() {
            return Ok(claimed);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
        Ok(None)
    }

    pub async fn ack(&self, token: &ClaimToken) -> QueueResult<()> {
        let broker = self.broker.clone();
        self.retrying("ack", move || {
            let broker = broker.clone();
            let token = token.clone();
            async move { broker.ack(&token).await }
        })
        .await
    }

    pub async fn retry(&self, token: &ClaimToken, delay: Duration, error: &str) -> QueueResult<()> {
        let broker = self.broker.clone();
        self.retrying("retry", move || {
            let broker = broker.clone();
            let token = token.clone();
            let error = error.to_string();
            async move { broker.retry(&token, delay, &error).await }
        })
        .await
    }

    pub async fn dead_letter(&self, token: &ClaimToken, error: &str) -> QueueResult<()> {
        let broker = self.broker.clone();
        self.retrying("dead_letter", move || {
            let broker = broker.clone();
            let token = token.clone();
            let error = error.to_string();
            async move { broker.dead_letter(&token, &error).await }
        })
        .await
    }

    pub async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        let broker = self.broker.clone();
        self.retrying("queue_depth", move || {
            let broker = broker.clone();
            let queue = queue.to_string();
            async move { broker.queue_depth(&queue).await }
        })
        .await
    }

    pub async fn dead_letters(&self) -> QueueResult<Vec<Envelope>> {
        let broker = self.broker.clone();
        self.retrying("dead_letters", move || {
            let broker = broker.clone();
            async move { broker.dead_letters().await }
        })
        .await
    }

    pub async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<bool> {
        let broker = self.broker.clone();
        self.retrying("requeue_dead_letter", move || {
            let broker = broker.clone();
            let job_id = job_id.clone();
            async move { broker.requeue_dead_letter(&job_id).await }
        })
        .await
    }

    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        self.broker.event_stream()
    }
}
