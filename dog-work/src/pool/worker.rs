use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    BrokerClient, ClaimToken, ClaimedJob, Envelope, JobError, JobResult,
    middleware::MiddlewareChain,
    pool::retry::{RetryDecision, RetryPolicy},
    registry::HandlerRegistry,
};

/// Where a worker is in its claim/execute/settle cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Claiming,
    Running,
    Acking,
    RetryingScheduled,
    DeadLettering,
    /// Loop exited after shutdown
    Stopped,
}

impl WorkerState {
    /// Holding a claim that has not been settled yet
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Acking | Self::RetryingScheduled | Self::DeadLettering
        )
    }
}

pub(crate) type ContextFactory<C> = Arc<dyn Fn() -> C + Send + Sync>;

/// Immutable state shared by every worker of a pool
pub(crate) struct Shared<C> {
    pub client: BrokerClient,
    pub queues: Vec<String>,
    pub chain: MiddlewareChain<C>,
    pub registry: HandlerRegistry<C>,
    pub retry: RetryPolicy,
    pub context: ContextFactory<C>,
    pub states: Arc<RwLock<Vec<WorkerState>>>,
}

pub(crate) struct Worker<C> {
    id: usize,
    shared: Arc<Shared<C>>,
}

/// Sender dropped counts as shutdown
fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl<C: Send + 'static> Worker<C> {
    pub fn new(id: usize, shared: Arc<Shared<C>>) -> Self {
        Self { id, shared }
    }

    fn set_state(&self, state: WorkerState) {
        if let Some(slot) = self.shared.states.write().get_mut(self.id) {
            *slot = state;
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, queues = ?self.shared.queues, "Worker started");

        while !is_shutdown(&shutdown) {
            self.set_state(WorkerState::Claiming);

            match self.shared.client.claim_next(&self.shared.queues, &mut shutdown).await {
                Ok(Some(claimed)) => self.process(claimed).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = self.id, error = %e, "Claim failed, polling again");
                    self.set_state(WorkerState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(self.shared.client.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }

            self.set_state(WorkerState::Idle);
        }

        self.set_state(WorkerState::Stopped);
        info!(worker = self.id, "Worker stopped");
    }

    #[instrument(
        skip_all,
        fields(
            worker = self.id,
            job_id = %claimed.envelope.job_id,
            job_name = claimed.envelope.name(),
            attempt = claimed.envelope.attempt,
        )
    )]
    async fn process(&self, claimed: ClaimedJob) {
        self.set_state(WorkerState::Running);
        let ClaimedJob { envelope, token, .. } = claimed;

        let result = self.execute(&envelope).await;
        self.settle(&envelope, &token, result).await;
    }

    /// Run middleware and handler against a fresh context
    async fn execute(&self, envelope: &Envelope) -> JobResult {
        let shared = &self.shared;
        let mut ctx = (shared.context)();

        let attempt = AssertUnwindSafe(shared.chain.run(&shared.registry, envelope, &mut ctx));
        match attempt.catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = self.id, job_id = %envelope.job_id, panic = %message, "Job panicked");
                Err(JobError::Panicked(message))
            }
        }
    }

    async fn settle(&self, envelope: &Envelope, token: &ClaimToken, result: JobResult) {
        let client = &self.shared.client;

        let settled = match result {
            Ok(()) => {
                self.set_state(WorkerState::Acking);
                debug!(job_id = %envelope.job_id, "Acking");
                client.ack(token).await
            }
            Err(job_error) => {
                let message = job_error.to_string();
                match self.shared.retry.decide(envelope.attempt, &job_error) {
                    RetryDecision::Retry(delay) => {
                        self.set_state(WorkerState::RetryingScheduled);
                        warn!(
                            job_id = %envelope.job_id,
                            attempt = envelope.attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Scheduling retry"
                        );
                        client.retry(token, delay, &message).await
                    }
                    RetryDecision::DeadLetter => {
                        self.set_state(WorkerState::DeadLettering);
                        error!(
                            job_id = %envelope.job_id,
                            attempt = envelope.attempt,
                            retryable = job_error.is_retryable(),
                            error = %message,
                            "Dead-lettering job"
                        );
                        client.dead_letter(token, &message).await
                    }
                }
            }
        };

        // Left claimed; the broker redelivers after the visibility timeout
        if let Err(e) = settled {
            error!(
                worker = self.id,
                job_id = %envelope.job_id,
                error = %e,
                "Failed to settle job"
            );
        }
    }
}
