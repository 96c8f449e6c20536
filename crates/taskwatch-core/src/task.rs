use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::attachment::Attachment;
use crate::error::CoreError;

pub const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiring_info_at: Option<DateTime<Utc>>,
    pub expired_info_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Task {
    /// A fresh, unsaved task. The store assigns `id` and `user_id` on create.
    pub fn new(name: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: 0,
            user_id: String::new(),
            name: name.into(),
            expires_at,
            expiring_info_at: None,
            expired_info_at: None,
            created_at: Utc::now(),
            updated_at: None,
            completed_at: None,
            attachments: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let len = self.name.trim().chars().count();
        if len == 0 {
            return Err(CoreError::InvalidInput("task name is required".into()));
        }
        if len > MAX_NAME_LEN {
            return Err(CoreError::InvalidInput(format!(
                "task name exceeds {MAX_NAME_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Rename or reschedule. Clears both notification markers so the task
    /// goes through the expiring/expired lifecycle again.
    pub fn update(&mut self, name: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        self.name = name.into();
        self.expires_at = expires_at;
        self.expiring_info_at = None;
        self.expired_info_at = None;
        self.updated_at = Some(Utc::now());
    }

    pub fn set_expiring_info_at(&mut self, at: DateTime<Utc>) {
        self.expiring_info_at = Some(at);
        self.updated_at = Some(at);
    }

    pub fn set_expired_info_at(&mut self, at: DateTime<Utc>) {
        self.expired_info_at = Some(at);
        self.updated_at = Some(at);
    }

    pub fn set_completed(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.updated_at = Some(at);
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// In-memory form of the store's expiring predicate.
    pub fn is_expiring(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.expires_at {
            Some(at) => {
                !self.is_completed()
                    && self.expiring_info_at.is_none()
                    && at >= now
                    && at < now + window
            }
            None => false,
        }
    }

    /// In-memory form of the store's expired predicate.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => !self.is_completed() && self.expired_info_at.is_none() && at < now,
            None => false,
        }
    }
}
