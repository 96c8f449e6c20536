use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use tracing::info;

use super::Email;
use crate::NotifyError;

#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn send_email(&self, email: &Email) -> Result<(), NotifyError>;
}

/// Logs emails instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEmailClient;

#[async_trait]
impl EmailClient for NullEmailClient {
    async fn send_email(&self, email: &Email) -> Result<(), NotifyError> {
        info!("email to {} not sent: {}", email.to, email.subject);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_name: String,
    /// Sender address, also the SMTP login.
    pub from_address: String,
    pub password: String,
}

/// Sends through an SMTP relay with mandatory STARTTLS.
pub struct SmtpEmailClient {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpEmailClient {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        if config.host.is_empty() {
            return Err(NotifyError::Config("SMTP host is not set".into()));
        }
        let from = sender(config)?;
        let credentials = Credentials::new(config.from_address.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| NotifyError::Config(format!("SMTP relay {}: {e}", config.host)))?
            .port(config.port)
            .credentials(credentials)
            .build();
        Ok(Self { from, transport })
    }
}

fn sender(config: &SmtpConfig) -> Result<Mailbox, NotifyError> {
    format!("{} <{}>", config.from_name, config.from_address)
        .parse()
        .map_err(|e| NotifyError::Config(format!("invalid sender address: {e}")))
}

fn build_message(from: &Mailbox, email: &Email) -> Result<LettreMessage, NotifyError> {
    let to: Mailbox = email
        .to
        .parse()
        .map_err(|e| NotifyError::InvalidRecipient(format!("'{}': {e}", email.to)))?;
    LettreMessage::builder()
        .from(from.clone())
        .to(to)
        .subject(email.subject.clone())
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())
        .map_err(|e| NotifyError::Send(format!("build email: {e}")))
}

#[async_trait]
impl EmailClient for SmtpEmailClient {
    async fn send_email(&self, email: &Email) -> Result<(), NotifyError> {
        let message = build_message(&self.from, email)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Send(format!("SMTP send: {e}")))?;
        info!("email sent to {}", email.to);
        Ok(())
    }
}
