use std::sync::Arc;
use std::time::Instant;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::{registry::HandlerRegistry, Envelope, JobError, JobResult};

/// A step that runs before the handler.
///
/// Calling `next.run(..)` continues the chain; returning without calling
/// it short-circuits the attempt with whatever result is returned.
#[async_trait]
pub trait Middleware<C>: Send + Sync {
    async fn call(&self, envelope: &Envelope, ctx: &mut C, next: Next<'_, C>) -> JobResult;
}

/// The remainder of the chain, ending in handler dispatch
pub struct Next<'a, C> {
    middleware: &'a [Arc<dyn Middleware<C>>],
    registry: &'a HandlerRegistry<C>,
}

impl<'a, C: Send + 'static> Next<'a, C> {
    pub fn new(middleware: &'a [Arc<dyn Middleware<C>>], registry: &'a HandlerRegistry<C>) -> Self {
        Self { middleware, registry }
    }

    pub async fn run(self, envelope: &Envelope, ctx: &mut C) -> JobResult {
        match self.middleware.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    middleware: rest,
                    registry: self.registry,
                };
                current.call(envelope, ctx, next).await
            }
            None => match self.registry.get(envelope.name()) {
                Some(handler) => handler.handle(envelope, ctx).await,
                None => Err(JobError::UnknownJob(envelope.name().to_string())),
            },
        }
    }
}

/// Ordered middleware, fixed once the pool starts
pub struct MiddlewareChain<C> {
    middleware: Vec<Arc<dyn Middleware<C>>>,
}

impl<C: Send + 'static> MiddlewareChain<C> {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Append a step; steps run in registration order
    pub fn push<M: Middleware<C> + 'static>(&mut self, middleware: M) {
        self.middleware.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run every step in order, then the handler registered for the envelope's name
    pub async fn run(&self, registry: &HandlerRegistry<C>, envelope: &Envelope, ctx: &mut C) -> JobResult {
        Next::new(&self.middleware, registry).run(envelope, ctx).await
    }
}

impl<C: Send + 'static> Default for MiddlewareChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs the start and outcome of every attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMiddleware;

#[async_trait]
impl<C: Send + 'static> Middleware<C> for LogMiddleware {
    async fn call(&self, envelope: &Envelope, ctx: &mut C, next: Next<'_, C>) -> JobResult {
        let started = Instant::now();
        info!(
            job_id = %envelope.job_id,
            job_name = envelope.name(),
            queue = %envelope.queue,
            attempt = envelope.attempt,
            "Starting job"
        );

        let result = next.run(envelope, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(job_id = %envelope.job_id, job_name = envelope.name(), elapsed_ms, "Job succeeded"),
            Err(e) => warn!(job_id = %envelope.job_id, job_name = envelope.name(), elapsed_ms, error = %e, "Job failed"),
        }
        result
    }
}
