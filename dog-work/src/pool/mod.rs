//! Fixed-size pool of claim/execute/settle workers.

pub mod retry;
pub mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    BrokerClient, QueueError, QueueResult, WorkConfig,
    lifecycle::DrainReport,
    middleware::{Middleware, MiddlewareChain},
    registry::{Handler, HandlerRegistry},
};

pub use retry::{RetryDecision, RetryPolicy};
pub use worker::WorkerState;

use worker::{ContextFactory, Shared, Worker};

/// Entry point for building a pool
pub struct WorkerPool;

impl WorkerPool {
    /// Builder whose per-attempt context is `C::default()`
    pub fn builder<C>(client: BrokerClient) -> WorkerPoolBuilder<C>
    where
        C: Default + Send + 'static,
    {
        WorkerPoolBuilder::new(client)
    }
}

/// Collects queues, middleware and handlers, then starts the workers
pub struct WorkerPoolBuilder<C> {
    client: BrokerClient,
    queues: Vec<String>,
    pool_size: usize,
    retry: RetryPolicy,
    chain: MiddlewareChain<C>,
    registry: HandlerRegistry<C>,
    required_jobs: Vec<String>,
    context: ContextFactory<C>,
    registration_error: Option<QueueError>,
}

impl<C: Send + 'static> WorkerPoolBuilder<C> {
    pub fn new(client: BrokerClient) -> Self
    where
        C: Default,
    {
        Self::with_context(client, C::default)
    }

    /// Builder with a custom per-attempt context constructor
    pub fn with_context<F>(client: BrokerClient, context: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            client,
            queues: Vec::new(),
            pool_size: 10,
            retry: RetryPolicy::default(),
            chain: MiddlewareChain::new(),
            registry: HandlerRegistry::new(),
            required_jobs: Vec::new(),
            context: Arc::new(context),
            registration_error: None,
        }
    }

    /// Apply queues, pool size, retry policy and required jobs from config
    pub fn config(mut self, config: &WorkConfig) -> Self {
        self.queues = config.queues.clone();
        self.pool_size = config.pool_size;
        self.retry = config.retry_policy();
        self.required_jobs = config.jobs.clone();
        self
    }

    /// Add a queue; earlier queues are claimed from first
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Append middleware; runs in registration order for every job
    pub fn middleware<M: Middleware<C> + 'static>(mut self, middleware: M) -> Self {
        self.chain.push(middleware);
        self
    }

    /// Register a handler. A duplicate name fails `start`.
    pub fn handler<H: Handler<C> + 'static>(mut self, name: impl Into<String>, handler: H) -> Self {
        if let Err(e) = self.registry.register(name, handler) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    /// Use a prebuilt registry, replacing handlers added so far
    pub fn registry(mut self, registry: HandlerRegistry<C>) -> Self {
        self.registry = registry;
        self
    }

    /// Job names that must have a handler at start
    pub fn require_jobs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_jobs.extend(names.into_iter().map(Into::into));
        self
    }

    /// Validate and spawn `pool_size` workers
    pub fn start(self) -> QueueResult<RunningPool> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        if self.queues.is_empty() {
            return Err(QueueError::config("worker pool needs at least one queue"));
        }
        if self.pool_size == 0 {
            return Err(QueueError::config("pool size must be at least 1"));
        }
        self.registry.validate(&self.required_jobs)?;

        let states = Arc::new(RwLock::new(vec![WorkerState::Idle; self.pool_size]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client: self.client,
            queues: self.queues,
            chain: self.chain,
            registry: self.registry,
            retry: self.retry,
            context: self.context,
            states: states.clone(),
        });

        let workers = (0..self.pool_size)
            .map(|id| {
                let worker = Worker::new(id, shared.clone());
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();

        info!(
            pool_size = self.pool_size,
            queues = ?shared.queues,
            jobs = ?shared.registry.names(),
            middleware = shared.chain.len(),
            "Worker pool started"
        );

        Ok(RunningPool {
            shutdown_tx,
            workers,
            states,
        })
    }
}

/// Handle to a started pool
pub struct RunningPool {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    states: Arc<RwLock<Vec<WorkerState>>>,
}

impl RunningPool {
    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Snapshot of every worker's state, indexed by worker id
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states.read().clone()
    }

    /// Stop claiming new jobs; in-flight jobs keep running
    pub fn stop_claiming(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop claiming and wait for every worker to finish its current job
    pub async fn shutdown(self) -> DrainReport {
        self.drain(None).await
    }

    /// Like `shutdown`, but abort workers still busy after `timeout`
    pub async fn shutdown_with_timeout(self, timeout: Duration) -> DrainReport {
        self.drain(Some(timeout)).await
    }

    pub(crate) async fn drain(mut self, timeout: Option<Duration>) -> DrainReport {
        let started = Instant::now();
        self.stop_claiming();

        let busy = self.worker_states().iter().filter(|state| state.is_busy()).count();
        info!(workers = self.workers.len(), busy, "Draining worker pool");

        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        let mut abandoned = 0;

        for (id, handle) in self.workers.iter_mut().enumerate() {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut *handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        handle.abort();
                        abandoned += 1;
                        warn!(worker = id, "Drain timeout elapsed, abandoning in-flight job");
                        continue;
                    }
                },
                None => (&mut *handle).await,
            };

            if let Err(e) = joined {
                error!(worker = id, error = %e, "Worker task failed");
            }
        }

        let report = DrainReport {
            workers: self.workers.len(),
            abandoned,
            elapsed: started.elapsed(),
        };
        info!(
            workers = report.workers,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Worker pool drained"
        );
        report
    }
}
