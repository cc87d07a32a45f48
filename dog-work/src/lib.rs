//! # dog-work: durable background job dispatch
//!
//! Producers enqueue named jobs with loosely typed arguments onto named
//! queues. A fixed-size pool of workers claims them from a broker, runs each
//! through an ordered middleware chain to its registered handler, and
//! settles the outcome: ack on success, delayed retry with exponential
//! backoff on failure, dead letter once the retry budget is spent.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_work::prelude::*;
//!
//! #[derive(Default)]
//! struct Ctx {
//!     email: String,
//! }
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Handler<Ctx> for SendEmail {
//!     async fn handle(&self, envelope: &Envelope, ctx: &mut Ctx) -> JobResult {
//!         ctx.email = envelope.arguments.string("email_address")?.to_string();
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let client = BrokerClient::new(Arc::new(MemoryBroker::new()));
//!
//! Enqueuer::new(client.clone(), "email")
//!     .enqueue("send_email", Arguments::new().with("email_address", "a@b.com"))
//!     .await?;
//!
//! let pool = WorkerPool::builder::<Ctx>(client)
//!     .queue("email")
//!     .pool_size(10)
//!     .middleware(LogMiddleware)
//!     .handler("send_email", SendEmail)
//!     .start()?;
//!
//! let report = run_until_signal(pool, None).await?;
//! assert_eq!(report.abandoned, 0);
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod broker;
pub mod middleware;
pub mod registry;
pub mod pool;
pub mod lifecycle;
pub mod enqueuer;
pub mod config;
pub mod observability;

pub use types::{ArgValue, Arguments, ClaimToken, ClaimedJob, Envelope, JobEvent, JobId};
pub use error::{ArgError, JobError, JobResult, QueueError, QueueResult};
pub use broker::{Broker, BrokerClient, BrokerRetry, MemoryBroker};
pub use middleware::{LogMiddleware, Middleware, MiddlewareChain, Next};
pub use registry::{Handler, HandlerRegistry};
pub use pool::{RetryDecision, RetryPolicy, RunningPool, WorkerPool, WorkerPoolBuilder, WorkerState};
pub use lifecycle::{run_until, run_until_signal, shutdown_signal, DrainReport};
pub use enqueuer::Enqueuer;
pub use config::WorkConfig;
pub use observability::{watch_events, JobCounters};

#[cfg(feature = "redis")]
pub use broker::redis::{RedisBroker, RedisPool};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to define handlers and run a pool
pub mod prelude {
    pub use crate::{
        Arguments, ArgValue, Envelope, JobId,
        JobError, JobResult, QueueError, QueueResult, ArgError,
        Broker, BrokerClient, MemoryBroker,
        Handler, Middleware, Next, LogMiddleware,
        WorkerPool, RunningPool, RetryPolicy,
        Enqueuer, WorkConfig,
        run_until, run_until_signal, shutdown_signal, DrainReport,
    };

    pub use async_trait::async_trait;
}
