use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::subject::NotificationKind;
use crate::task::Task;

/// Payload published for every task lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEventMsg {
    pub task: Task,
}

impl TaskEventMsg {
    pub fn new(task: Task) -> Self {
        Self { task }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::InvalidInput(e.to_string()))
    }

    /// Decode and structurally validate a payload for an event of `kind`.
    pub fn decode(data: &[u8], kind: NotificationKind) -> Result<Self, CoreError> {
        let msg: TaskEventMsg = serde_json::from_slice(data)
            .map_err(|e| CoreError::InvalidInput(format!("malformed payload: {e}")))?;
        msg.validate(kind)?;
        Ok(msg)
    }

    pub fn validate(&self, kind: NotificationKind) -> Result<(), CoreError> {
        let task = &self.task;
        if task.id <= 0 {
            return Err(CoreError::InvalidInput("task id must be positive".into()));
        }
        if task.user_id.is_empty() {
            return Err(CoreError::InvalidInput("task user_id is required".into()));
        }
        task.validate()?;
        if task.expires_at.is_none() {
            return Err(CoreError::InvalidInput(format!(
                "{kind} event for task {} has no expires_at",
                task.id
            )));
        }
        Ok(())
    }
}
