use std::fmt;

use crate::error::CoreError;

/// Durable stream carrying task lifecycle events.
pub const TASKS_STREAM: &str = "tasks";
/// Subject filter captured by [`TASKS_STREAM`].
pub const TASKS_STREAM_SUBJECTS: &str = "task.>";

const EVENT_PREFIX: &str = "task";
const UI_PREFIX: &str = "tasks.ui";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Expiring,
    Expired,
}

impl NotificationKind {
    pub const ALL: &[NotificationKind] = &[NotificationKind::Expiring, NotificationKind::Expired];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Expiring => "expiring",
            NotificationKind::Expired => "expired",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "expiring" => Some(NotificationKind::Expiring),
            "expired" => Some(NotificationKind::Expired),
            _ => None,
        }
    }

    /// Human-facing title used for email subjects.
    pub fn title(&self) -> &'static str {
        match self {
            NotificationKind::Expiring => "Task Expiring",
            NotificationKind::Expired => "Task Expired",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed form of `task.<user_id>.<task_id>.<kind>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubject {
    pub user_id: String,
    pub task_id: i64,
    pub kind: NotificationKind,
}

impl EventSubject {
    pub fn parse(subject: &str) -> Option<Self> {
        let mut parts = subject.split('.');
        if parts.next()? != EVENT_PREFIX {
            return None;
        }
        let user_id = parts.next()?;
        let task_id = parts.next()?.parse().ok()?;
        let kind = NotificationKind::parse_str(parts.next()?)?;
        if parts.next().is_some() || !is_valid_token(user_id) {
            return None;
        }
        Some(Self {
            user_id: user_id.to_string(),
            task_id,
            kind,
        })
    }
}

/// Subject a lifecycle event for `task_id` is published on.
pub fn event_subject(
    user_id: &str,
    task_id: i64,
    kind: NotificationKind,
) -> Result<String, CoreError> {
    check_token(user_id)?;
    Ok(format!("{EVENT_PREFIX}.{user_id}.{task_id}.{kind}"))
}

/// Best-effort subject the UI relay republishes on.
pub fn ui_subject(user_id: &str, task_id: i64, kind: NotificationKind) -> Result<String, CoreError> {
    check_token(user_id)?;
    Ok(format!("{UI_PREFIX}.{user_id}.{task_id}.{kind}"))
}

/// Pattern matching every UI event for one user.
pub fn ui_user_pattern(user_id: &str) -> Result<String, CoreError> {
    check_token(user_id)?;
    Ok(format!("{UI_PREFIX}.{user_id}.>"))
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

fn check_token(token: &str) -> Result<(), CoreError> {
    if is_valid_token(token) {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!(
            "'{token}' cannot be used as a subject token"
        )))
    }
}
