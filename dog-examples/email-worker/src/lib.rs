//! Email delivery worker built on dog-work.
//!
//! Enqueues `send_email` jobs on the `email` queue and processes them with a
//! pool whose middleware logs every attempt and hydrates the recipient.

pub mod transport;

use std::sync::Arc;
use async_trait::async_trait;
use tracing::info;

use dog_work::prelude::*;
use dog_work::BrokerClient;

pub use transport::{transport_from_env, EmailMessage, EmailTransport, LogTransport, ResendTransport, TransportError};

pub const EMAIL_QUEUE: &str = "email";
pub const SEND_EMAIL: &str = "send_email";

/// Per-attempt context filled in by `FindUser`
#[derive(Debug, Default, Clone)]
pub struct UserContext {
    pub email: Option<String>,
    pub user_id: Option<i64>,
}

/// Loads the recipient for jobs that carry a `user_id`
pub struct FindUser;

#[async_trait]
impl Middleware<UserContext> for FindUser {
    async fn call(&self, envelope: &Envelope, ctx: &mut UserContext, next: Next<'_, UserContext>) -> JobResult {
        if envelope.arguments.contains("user_id") {
            ctx.email = Some(envelope.arguments.string("email_address")?.to_string());
            ctx.user_id = Some(envelope.arguments.int("user_id")?);
        }
        next.run(envelope, ctx).await
    }
}

/// Sends the welcome email to the hydrated recipient
pub struct SendEmail {
    transport: Arc<dyn EmailTransport>,
    from: String,
}

impl SendEmail {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            transport,
            from: "Acme <onboarding@resend.dev>".to_string(),
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    fn message(&self, to: &str) -> EmailMessage {
        EmailMessage {
            from: self.from.clone(),
            to: vec![to.to_string()],
            subject: "Hello from dog-work".to_string(),
            html: "<strong>hello world</strong>".to_string(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
        }
    }
}

#[async_trait]
impl Handler<UserContext> for SendEmail {
    async fn handle(&self, envelope: &Envelope, ctx: &mut UserContext) -> JobResult {
        let to = ctx
            .email
            .as_deref()
            .ok_or_else(|| JobError::permanent("no recipient: job carries no user_id"))?;

        let message_id = self
            .transport
            .send(&self.message(to))
            .await
            .map_err(|e| JobError::failed(e.to_string()))?;

        info!(
            job_id = %envelope.job_id,
            user_id = ctx.user_id,
            transport = self.transport.name(),
            message_id = %message_id,
            "Email sent"
        );
        Ok(())
    }
}

/// Arguments for one `send_email` job
pub fn send_email_args(email_address: &str, user_id: i64) -> Arguments {
    Arguments::new()
        .with("email_address", email_address)
        .with("user_id", user_id)
}

/// Start the email pool: log first, then user hydration, then `send_email`
pub fn start_pool(
    client: BrokerClient,
    config: &WorkConfig,
    transport: Arc<dyn EmailTransport>,
) -> QueueResult<RunningPool> {
    WorkerPool::builder::<UserContext>(client)
        .config(config)
        .middleware(LogMiddleware)
        .middleware(FindUser)
        .handler(SEND_EMAIL, SendEmail::new(transport))
        .start()
}
