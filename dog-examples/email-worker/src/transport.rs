use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// One outgoing email
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Email rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport configuration error: {0}")]
    Config(String),
}

/// Delivers an email and returns the provider's message id
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<String, TransportError>;

    fn name(&self) -> &'static str;
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

/// Resend HTTP API transport
pub struct ResendTransport {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl ResendTransport {
    pub fn new(api_key: impl Into<String>) -> Result<Self, TransportError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(TransportError::Config("Resend API key is empty".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint: RESEND_ENDPOINT.to_string(),
        })
    }

    /// Point at a different API base (for staging or a local mock)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let sent: SendResponse = response.json().await?;
        Ok(sent.id)
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

/// Logs instead of sending
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, TransportError> {
        let id = format!("dry-run-{}", dog_work::JobId::new());
        info!(
            message_id = %id,
            to = ?message.to,
            subject = %message.subject,
            "Dry run, email not sent"
        );
        Ok(id)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Resend when `RESEND_API_KEY` is set, otherwise the dry-run transport
pub fn transport_from_env() -> Box<dyn EmailTransport> {
    match std::env::var("RESEND_API_KEY") {
        Ok(key) => match ResendTransport::new(key) {
            Ok(transport) => return Box::new(transport),
            Err(e) => warn!(error = %e, "Ignoring RESEND_API_KEY"),
        },
        Err(_) => warn!("RESEND_API_KEY not set, emails will only be logged"),
    }
    Box::new(LogTransport)
}
