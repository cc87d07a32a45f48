use std::sync::Arc;
use anyhow::Result;
use tracing::{info, warn};

use dog_work::{run_until_signal, watch_events, Enqueuer, WorkConfig};
use email_worker::{send_email_args, start_pool, transport_from_env, EMAIL_QUEUE, SEND_EMAIL};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    dog_work::init_tracing(std::env::var("LOG_JSON").is_ok());
    if dotenv.is_err() {
        warn!("Unable to find .env file");
    }

    let mut config = WorkConfig::from_env()?;
    if std::env::var("DOG_WORK_QUEUES").is_err() {
        config.queues = vec![EMAIL_QUEUE.to_string()];
    }
    if config.jobs.is_empty() {
        config.jobs = vec![SEND_EMAIL.to_string()];
    }

    let client = config.broker_client()?;
    info!(broker = client.broker().name(), queues = ?config.queues, "Connected to broker");
    let (counters, events) = watch_events(client.event_stream());

    let recipient = std::env::var("EMAIL_TO").unwrap_or_else(|_| "delivered@resend.dev".to_string());
    let job_id = Enqueuer::new(client.clone(), EMAIL_QUEUE)
        .enqueue(SEND_EMAIL, send_email_args(&recipient, 123))
        .await?;
    info!(job_id = %job_id, "Enqueued welcome email");

    let pool = start_pool(client, &config, Arc::from(transport_from_env()))?;

    let report = run_until_signal(pool, config.drain_timeout()).await?;
    events.abort();

    let totals = counters.read().clone();
    info!(
        workers = report.workers,
        abandoned = report.abandoned,
        elapsed_ms = report.elapsed.as_millis() as u64,
        acked = totals.acked,
        retried = totals.retried,
        dead_lettered = totals.dead_lettered,
        reclaimed = totals.reclaimed,
        "Email worker stopped"
    );

    Ok(())
}
