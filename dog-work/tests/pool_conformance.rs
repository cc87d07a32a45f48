use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use dog_work::{
    Arguments, Broker, BrokerClient, BrokerRetry, ClaimToken, ClaimedJob, Envelope, Handler,
    JobError, JobId, JobResult, LogMiddleware, MemoryBroker, Middleware, Next, QueueError,
    QueueResult, RetryPolicy, WorkerPool, WorkerState, run_until,
};

/// Context hydrated by `FindUser`
#[derive(Default)]
struct UserCtx {
    email: Option<String>,
    user_id: Option<i64>,
}

struct FindUser;

#[async_trait]
impl Middleware<UserCtx> for FindUser {
    async fn call(&self, envelope: &Envelope, ctx: &mut UserCtx, next: Next<'_, UserCtx>) -> JobResult {
        if envelope.arguments.contains("user_id") {
            ctx.email = Some(envelope.arguments.string("email_address")?.to_string());
            ctx.user_id = Some(envelope.arguments.int("user_id")?);
        }
        next.run(envelope, ctx).await
    }
}

/// Records what every attempt saw, failing while `fail` is set
#[derive(Clone, Default)]
struct Recorder {
    attempts: Arc<Mutex<Vec<(u32, Option<String>)>>>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl Handler<UserCtx> for Recorder {
    async fn handle(&self, envelope: &Envelope, ctx: &mut UserCtx) -> JobResult {
        self.attempts.lock().push((envelope.attempt, ctx.email.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(JobError::failed("smtp down"));
        }
        Ok(())
    }
}

fn client(broker: &Arc<MemoryBroker>) -> BrokerClient {
    BrokerClient::new(broker.clone())
        .with_retry(BrokerRetry::none())
        .with_poll_interval(Duration::from_millis(10))
        .with_visibility_timeout(Duration::from_secs(30))
}

fn client_over(broker: Arc<dyn Broker>) -> BrokerClient {
    BrokerClient::new(broker)
        .with_retry(BrokerRetry::none())
        .with_poll_interval(Duration::from_millis(10))
        .with_visibility_timeout(Duration::from_secs(30))
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
}

fn send_email_args() -> Arguments {
    Arguments::new()
        .with("email_address", "a@b.com")
        .with("user_id", 123)
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

async fn settled(broker: &Arc<MemoryBroker>, queue: &str) -> bool {
    broker.queue_depth(queue).await.unwrap() == 0 && broker.in_flight() == 0
}

/// P1. send_email success hydrates context and acks
#[tokio::test]
async fn test_send_email_success() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();

    // Arrange: one send_email job
    client(&broker).enqueue("email", "send_email", send_email_args()).await.unwrap();

    // Act: run a pool until the queue drains
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(2)
        .middleware(LogMiddleware)
        .middleware(FindUser)
        .handler("send_email", recorder.clone())
        .start()
        .unwrap();

    wait_until("ack", || {
        let broker = broker.clone();
        let recorder = recorder.clone();
        async move { !recorder.attempts.lock().is_empty() && settled(&broker, "email").await }
    })
    .await;
    let report = pool.shutdown().await;

    // Assert: handler saw the hydrated email exactly once, nothing left
    assert_eq!(*recorder.attempts.lock(), vec![(0, Some("a@b.com".to_string()))]);
    assert!(broker.dead_letters().await.unwrap().is_empty());
    assert_eq!(report.workers, 2);
    assert!(report.is_clean());
}

/// P2. Always-failing job runs max_retries + 1 times, then dead-letters
#[tokio::test]
async fn test_always_failing_job_dead_lettered() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();
    recorder.fail.store(true, Ordering::SeqCst);

    // Arrange
    let job_id = client(&broker).enqueue("email", "send_email", send_email_args()).await.unwrap();

    // Act
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .retry_policy(fast_retry(2))
        .middleware(FindUser)
        .handler("send_email", recorder.clone())
        .start()
        .unwrap();

    wait_until("dead letter", || {
        let broker = broker.clone();
        async move { !broker.dead_letters().await.unwrap().is_empty() }
    })
    .await;
    pool.shutdown().await;

    // Assert: attempts 0, 1, 2 then dead
    let attempts: Vec<u32> = recorder.attempts.lock().iter().map(|(attempt, _)| *attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);

    let dead = broker.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, job_id);
    assert_eq!(dead[0].attempt, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("smtp down"));
    assert_eq!(broker.queue_depth("email").await.unwrap(), 0);
}

struct Trace {
    name: &'static str,
    log: Arc<Mutex<HashMap<String, Vec<&'static str>>>>,
}

#[async_trait]
impl Middleware<UserCtx> for Trace {
    async fn call(&self, envelope: &Envelope, ctx: &mut UserCtx, next: Next<'_, UserCtx>) -> JobResult {
        self.log.lock().entry(envelope.name().to_string()).or_default().push(self.name);
        next.run(envelope, ctx).await
    }
}

struct Outcome {
    succeed: bool,
    log: Arc<Mutex<HashMap<String, Vec<&'static str>>>>,
}

#[async_trait]
impl Handler<UserCtx> for Outcome {
    async fn handle(&self, envelope: &Envelope, _ctx: &mut UserCtx) -> JobResult {
        self.log.lock().entry(envelope.name().to_string()).or_default().push("handler");
        if self.succeed {
            Ok(())
        } else {
            Err(JobError::failed("nope"))
        }
    }
}

/// P3. Middleware runs in registration order for passing and failing jobs
#[tokio::test]
async fn test_middleware_order_for_every_job() {
    let broker = Arc::new(MemoryBroker::new());
    let log = Arc::new(Mutex::new(HashMap::new()));

    // Arrange
    let producer = client(&broker);
    producer.enqueue("email", "ok", Arguments::new()).await.unwrap();
    producer.enqueue("email", "fail", Arguments::new()).await.unwrap();

    // Act
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .retry_policy(fast_retry(0))
        .middleware(Trace { name: "first", log: log.clone() })
        .middleware(Trace { name: "second", log: log.clone() })
        .handler("ok", Outcome { succeed: true, log: log.clone() })
        .handler("fail", Outcome { succeed: false, log: log.clone() })
        .start()
        .unwrap();

    wait_until("both jobs settled", || {
        let broker = broker.clone();
        async move { settled(&broker, "email").await && broker.dead_letters().await.unwrap().len() == 1 }
    })
    .await;
    pool.shutdown().await;

    // Assert
    let log = log.lock();
    assert_eq!(log["ok"], vec!["first", "second", "handler"]);
    assert_eq!(log["fail"], vec!["first", "second", "handler"]);
}

/// Detects two workers inside the handler with the same job id
#[derive(Clone, Default)]
struct Exclusive {
    active: Arc<Mutex<HashSet<JobId>>>,
    runs: Arc<Mutex<HashMap<JobId, usize>>>,
    overlaps: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<UserCtx> for Exclusive {
    async fn handle(&self, envelope: &Envelope, _ctx: &mut UserCtx) -> JobResult {
        if !self.active.lock().insert(envelope.job_id.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        *self.runs.lock().entry(envelope.job_id.clone()).or_default() += 1;

        tokio::time::sleep(Duration::from_millis(2)).await;

        self.active.lock().remove(&envelope.job_id);
        Ok(())
    }
}

/// P4. No two workers hold the same job under contention
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_concurrent_claims_of_one_job() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Exclusive::default();

    // Arrange: more jobs than workers
    let producer = client(&broker);
    let mut ids = Vec::new();
    for _ in 0..60 {
        ids.push(producer.enqueue("email", "send_email", Arguments::new()).await.unwrap());
    }

    // Act
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(4)
        .handler("send_email", handler.clone())
        .start()
        .unwrap();

    wait_until("all jobs acked", || {
        let broker = broker.clone();
        async move { settled(&broker, "email").await }
    })
    .await;
    pool.shutdown().await;

    // Assert: each job ran exactly once, never concurrently
    assert_eq!(handler.overlaps.load(Ordering::SeqCst), 0);
    let runs = handler.runs.lock();
    assert_eq!(runs.len(), ids.len());
    assert!(ids.iter().all(|id| runs[id] == 1));
}

/// Blocks until released, signalling when it starts
#[derive(Clone, Default)]
struct Slow {
    started: Arc<Notify>,
    finished: Arc<AtomicUsize>,
    hold: Duration,
}

#[async_trait]
impl Handler<UserCtx> for Slow {
    async fn handle(&self, _envelope: &Envelope, _ctx: &mut UserCtx) -> JobResult {
        self.started.notify_one();
        tokio::time::sleep(self.hold).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// P5. Shutdown waits for the in-flight handler and claims nothing after
#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Slow {
        hold: Duration::from_millis(200),
        ..Slow::default()
    };

    // Arrange: two jobs, one worker
    let producer = client(&broker);
    producer.enqueue("email", "send_email", Arguments::new()).await.unwrap();
    producer.enqueue("email", "send_email", Arguments::new()).await.unwrap();

    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .handler("send_email", handler.clone())
        .start()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), handler.started.notified())
        .await
        .expect("handler should start");
    assert_eq!(pool.worker_states(), vec![WorkerState::Running]);

    // Act: signal immediately while the first job is mid-flight
    let report = run_until(pool, async {}, None).await;

    // Assert: first job completed and acked, second never claimed
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    assert!(report.is_clean());
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(broker.queue_depth("email").await.unwrap(), 1);
}

/// P6. Drain deadline abandons a hung handler, leaving its claim for redelivery
#[tokio::test]
async fn test_drain_timeout_abandons_hung_handler() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Slow {
        hold: Duration::from_secs(3600),
        ..Slow::default()
    };

    // Arrange
    let job_id = client(&broker).enqueue("email", "send_email", Arguments::new()).await.unwrap();
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(2)
        .handler("send_email", handler.clone())
        .start()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), handler.started.notified())
        .await
        .expect("handler should start");

    // Act
    let report = pool.shutdown_with_timeout(Duration::from_millis(100)).await;

    // Assert: one worker abandoned, claim still held until it lapses
    assert_eq!(report.workers, 2);
    assert_eq!(report.abandoned, 1);
    assert_eq!(handler.finished.load(Ordering::SeqCst), 0);
    assert_eq!(broker.in_flight(), 1);

    broker.force_claim_expiry(&job_id);
    assert_eq!(broker.reclaim_expired(), 1);
    assert_eq!(broker.queue_depth("email").await.unwrap(), 1);
}

/// P7. Configuration errors fail start
#[tokio::test]
async fn test_start_rejects_bad_configuration() {
    let broker = Arc::new(MemoryBroker::new());

    let no_queues = WorkerPool::builder::<UserCtx>(client(&broker))
        .handler("send_email", Recorder::default())
        .start();
    assert!(matches!(no_queues, Err(QueueError::Config(_))));

    let no_workers = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(0)
        .start();
    assert!(matches!(no_workers, Err(QueueError::Config(_))));

    let unregistered = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .handler("send_email", Recorder::default())
        .require_jobs(["send_email", "send_sms"])
        .start();
    assert!(matches!(unregistered, Err(QueueError::UnregisteredJob(name)) if name == "send_sms"));

    let duplicate = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .handler("send_email", Recorder::default())
        .handler("send_email", Recorder::default())
        .start();
    assert!(matches!(duplicate, Err(QueueError::DuplicateHandler(name)) if name == "send_email"));
}

/// P8. A wrong-typed argument fails the attempt explicitly
#[tokio::test]
async fn test_wrong_typed_argument_fails_attempt() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();

    // Arrange: user_id as a string
    let args = Arguments::new()
        .with("email_address", "a@b.com")
        .with("user_id", "123");
    client(&broker).enqueue("email", "send_email", args).await.unwrap();

    // Act
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .retry_policy(fast_retry(0))
        .middleware(FindUser)
        .handler("send_email", recorder.clone())
        .start()
        .unwrap();

    wait_until("dead letter", || {
        let broker = broker.clone();
        async move { !broker.dead_letters().await.unwrap().is_empty() }
    })
    .await;
    pool.shutdown().await;

    // Assert: handler never ran, error names the key and types
    assert!(recorder.attempts.lock().is_empty());
    let dead = broker.dead_letters().await.unwrap();
    let error = dead[0].last_error.as_deref().unwrap();
    assert!(error.contains("user_id"));
    assert!(error.contains("expected int"));
}

/// P9. Unknown job names are dead-lettered without retries
#[tokio::test]
async fn test_unknown_job_dead_lettered_immediately() {
    let broker = Arc::new(MemoryBroker::new());

    // Arrange
    client(&broker).enqueue("email", "send_sms", Arguments::new()).await.unwrap();

    // Act
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .retry_policy(fast_retry(5))
        .handler("send_email", Recorder::default())
        .start()
        .unwrap();

    wait_until("dead letter", || {
        let broker = broker.clone();
        async move { !broker.dead_letters().await.unwrap().is_empty() }
    })
    .await;
    pool.shutdown().await;

    // Assert: first attempt was the last
    let dead = broker.dead_letters().await.unwrap();
    assert_eq!(dead[0].attempt, 0);
    assert!(dead[0].last_error.as_deref().unwrap().contains("send_sms"));
}

/// Panics on the first attempt only
#[derive(Clone, Default)]
struct PanicOnce {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<UserCtx> for PanicOnce {
    async fn handle(&self, _envelope: &Envelope, _ctx: &mut UserCtx) -> JobResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("template missing");
        }
        Ok(())
    }
}

/// P10. A panicking handler is retried and the worker survives
#[tokio::test]
async fn test_panic_is_retryable_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = PanicOnce::default();

    // Arrange
    client(&broker).enqueue("email", "send_email", Arguments::new()).await.unwrap();

    // Act
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .retry_policy(fast_retry(3))
        .handler("send_email", handler.clone())
        .start()
        .unwrap();

    wait_until("retry acked", || {
        let broker = broker.clone();
        let handler = handler.clone();
        async move { handler.calls.load(Ordering::SeqCst) == 2 && settled(&broker, "email").await }
    })
    .await;
    let report = pool.shutdown().await;

    // Assert: acked on the second attempt by the same worker
    assert!(broker.dead_letters().await.unwrap().is_empty());
    assert!(report.is_clean());
}

/// P11. Dead letters can be requeued and then succeed
#[tokio::test]
async fn test_requeued_dead_letter_runs_again() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();
    recorder.fail.store(true, Ordering::SeqCst);

    // Arrange: dead-letter a job
    let job_id = client(&broker).enqueue("email", "send_email", send_email_args()).await.unwrap();
    let pool = WorkerPool::builder::<UserCtx>(client(&broker))
        .queue("email")
        .pool_size(1)
        .retry_policy(fast_retry(0))
        .middleware(FindUser)
        .handler("send_email", recorder.clone())
        .start()
        .unwrap();

    wait_until("dead letter", || {
        let broker = broker.clone();
        async move { !broker.dead_letters().await.unwrap().is_empty() }
    })
    .await;

    // Act: fix the handler and requeue
    recorder.fail.store(false, Ordering::SeqCst);
    assert!(broker.requeue_dead_letter(&job_id).await.unwrap());

    wait_until("requeued job acked", || {
        let broker = broker.clone();
        let recorder = recorder.clone();
        async move { recorder.attempts.lock().len() == 2 && settled(&broker, "email").await }
    })
    .await;
    pool.shutdown().await;

    // Assert: fresh attempt budget
    assert_eq!(recorder.attempts.lock()[1].0, 0);
    assert!(broker.dead_letters().await.unwrap().is_empty());
}

/// Memory broker whose `claim` and `ack` fail a fixed number of times
#[derive(Default)]
struct Faulty {
    inner: Arc<MemoryBroker>,
    claim_failures: AtomicUsize,
    ack_failures: AtomicUsize,
}

impl Faulty {
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for Faulty {
    async fn enqueue(&self, envelope: Envelope) -> QueueResult<JobId> {
        self.inner.enqueue(envelope).await
    }
    async fn claim(&self, queues: &[String], visibility: Duration) -> QueueResult<Option<ClaimedJob>> {
        if Self::take_failure(&self.claim_failures) {
            return Err(QueueError::BrokerUnavailable("connection refused".to_string()));
        }
        self.inner.claim(queues, visibility).await
    }
    async fn ack(&self, token: &ClaimToken) -> QueueResult<()> {
        if Self::take_failure(&self.ack_failures) {
            return Err(QueueError::BrokerUnavailable("connection reset".to_string()));
        }
        self.inner.ack(token).await
    }
    async fn retry(&self, token: &ClaimToken, delay: Duration, error: &str) -> QueueResult<()> {
        self.inner.retry(token, delay, error).await
    }
    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> QueueResult<()> {
        self.inner.dead_letter(token, error).await
    }
    async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        self.inner.queue_depth(queue).await
    }
    async fn dead_letters(&self) -> QueueResult<Vec<Envelope>> {
        self.inner.dead_letters().await
    }
    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<bool> {
        self.inner.requeue_dead_letter(job_id).await
    }
    fn name(&self) -> &'static str {
        "faulty"
    }
}

/// P12. Claim failures past the broker retry budget are survived
#[tokio::test]
async fn test_pool_survives_claim_failures() {
    let broker = Arc::new(MemoryBroker::new());
    let faulty = Arc::new(Faulty {
        inner: broker.clone(),
        claim_failures: AtomicUsize::new(3),
        ..Faulty::default()
    });
    let recorder = Recorder::default();

    // Arrange
    client(&broker).enqueue("email", "send_email", Arguments::new()).await.unwrap();

    // Act: every worker claim fails until the budget is used up
    let pool = WorkerPool::builder::<UserCtx>(client_over(faulty.clone()))
        .queue("email")
        .pool_size(1)
        .handler("send_email", recorder.clone())
        .start()
        .unwrap();

    wait_until("ack after claim failures", || {
        let broker = broker.clone();
        let recorder = recorder.clone();
        async move { recorder.attempts.lock().len() == 1 && settled(&broker, "email").await }
    })
    .await;

    // Assert: worker kept polling and the job ran once
    assert_eq!(faulty.claim_failures.load(Ordering::SeqCst), 0);
    assert_ne!(pool.worker_states(), vec![WorkerState::Stopped]);
    let report = pool.shutdown().await;
    assert!(report.is_clean());
    assert!(broker.dead_letters().await.unwrap().is_empty());
}

/// P13. A failed ack leaves the claim to lapse, then the job is redelivered
#[tokio::test]
async fn test_failed_ack_redelivered_after_visibility() {
    let broker = Arc::new(MemoryBroker::new());
    let faulty = Arc::new(Faulty {
        inner: broker.clone(),
        ack_failures: AtomicUsize::new(1),
        ..Faulty::default()
    });
    let recorder = Recorder::default();

    // Arrange
    let job_id = client(&broker).enqueue("email", "send_email", Arguments::new()).await.unwrap();

    let pool = WorkerPool::builder::<UserCtx>(client_over(faulty.clone()))
        .queue("email")
        .pool_size(1)
        .handler("send_email", recorder.clone())
        .start()
        .unwrap();

    wait_until("failed ack", || {
        let broker = broker.clone();
        let faulty = faulty.clone();
        let recorder = recorder.clone();
        async move {
            recorder.attempts.lock().len() == 1
                && faulty.ack_failures.load(Ordering::SeqCst) == 0
                && broker.in_flight() == 1
        }
    })
    .await;

    // Act: the visibility window lapses
    broker.force_claim_expiry(&job_id);

    wait_until("redelivered job acked", || {
        let broker = broker.clone();
        let recorder = recorder.clone();
        async move { recorder.attempts.lock().len() == 2 && settled(&broker, "email").await }
    })
    .await;
    pool.shutdown().await;

    // Assert: same attempt number on redelivery, nothing dead
    let attempts: Vec<u32> = recorder.attempts.lock().iter().map(|(attempt, _)| *attempt).collect();
    assert_eq!(attempts, vec![0, 0]);
    assert!(broker.dead_letters().await.unwrap().is_empty());
}
