use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::NotifyError;

/// Maps a task owner to the address notifications go to.
#[async_trait]
pub trait EmailResolver: Send + Sync {
    async fn resolve_email(&self, user_id: &str) -> Result<String, NotifyError>;
}

/// Treats the user id itself as the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEmailResolver;

#[async_trait]
impl EmailResolver for NullEmailResolver {
    async fn resolve_email(&self, user_id: &str) -> Result<String, NotifyError> {
        Ok(user_id.to_string())
    }
}

const ACTIVE_STATE: &str = "USER_STATE_ACTIVE";

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: DirectoryUser,
}

#[derive(Debug, Deserialize)]
struct DirectoryUser {
    #[serde(default)]
    state: String,
    human: Option<HumanProfile>,
}

#[derive(Debug, Deserialize)]
struct HumanProfile {
    email: Option<EmailProfile>,
}

#[derive(Debug, Deserialize)]
struct EmailProfile {
    #[serde(default)]
    email: String,
}

/// Looks users up in an identity directory over HTTP
/// (`GET {base}/v2/users/{user_id}` with a bearer token).
pub struct DirectoryEmailResolver {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl DirectoryEmailResolver {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, NotifyError> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(NotifyError::Config("directory URL is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("taskwatch")
            .build()?;
        Ok(Self {
            base_url: base_url.to_string(),
            token: token.into(),
            client,
        })
    }

    fn user_url(&self, user_id: &str) -> String {
        format!("{}/v2/users/{user_id}", self.base_url)
    }
}

#[async_trait]
impl EmailResolver for DirectoryEmailResolver {
    async fn resolve_email(&self, user_id: &str) -> Result<String, NotifyError> {
        let resp = self
            .client
            .get(self.user_url(user_id))
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        let envelope: UserEnvelope = resp.json().await?;

        if envelope.user.state != ACTIVE_STATE {
            return Err(NotifyError::Resolve(format!(
                "user {user_id} is not active ({})",
                envelope.user.state
            )));
        }
        envelope
            .user
            .human
            .and_then(|h| h.email)
            .map(|e| e.email)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| NotifyError::Resolve(format!("user {user_id} has no email address")))
    }
}
