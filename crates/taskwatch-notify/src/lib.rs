//! Durable consumers of the task event stream.

pub mod dispatch;
pub mod email;
mod ui;

use thiserror::Error;

pub use dispatch::{consume, deliver, Disposition, HandleError, NotificationHandler, REDELIVERY_DELAY};
pub use email::{
    DirectoryEmailResolver, Email, EmailClient, EmailNotifier, EmailResolver, NullEmailClient,
    NullEmailResolver, SmtpConfig, SmtpEmailClient, EMAIL_CONSUMER,
};
pub use ui::{UiNotifier, UI_CONSUMER};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("recipient lookup failed: {0}")]
    Resolve(String),

    /// The address can never be delivered to.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("email delivery failed: {0}")]
    Send(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Broker(#[from] taskwatch_broker::BrokerError),
}
