use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata row for a file attached to a task. Content lives in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub task_id: i64,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Difference between a task's stored attachments and a submitted name list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentsUpdate {
    /// File names to insert, in submission order.
    pub inserted: Vec<String>,
    /// Existing attachments to remove, keyed by attachment id.
    pub deleted: BTreeMap<i64, String>,
}

impl AttachmentsUpdate {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }

    pub fn deleted_ids(&self) -> Vec<i64> {
        self.deleted.keys().copied().collect()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.values().cloned().collect()
    }
}

/// Match `desired` against `current` by file name.
///
/// Every current attachment starts out as deleted; each desired name that
/// matches one is kept instead, and names with no match are inserted.
/// Repeated desired names are only considered once.
pub fn reconcile_attachments(current: &[Attachment], desired: &[String]) -> AttachmentsUpdate {
    let mut deleted: BTreeMap<i64, String> = current
        .iter()
        .map(|a| (a.id, a.file_name.clone()))
        .collect();
    let mut inserted = Vec::new();
    let mut seen = HashSet::new();

    for name in desired {
        if !seen.insert(name.as_str()) {
            continue;
        }
        let kept = deleted
            .iter()
            .find(|(_, existing)| *existing == name)
            .map(|(id, _)| *id);
        match kept {
            Some(id) => {
                deleted.remove(&id);
            }
            None => inserted.push(name.clone()),
        }
    }

    AttachmentsUpdate { inserted, deleted }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn att(id: i64, name: &str) -> Attachment {
        Attachment {
            id,
            task_id: 1,
            file_name: name.into(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keeps_matches_inserts_new_deletes_missing() {
        let current = vec![att(1, "a"), att(2, "b")];
        let update = reconcile_attachments(&current, &names(&["b", "c"]));

        assert_eq!(update.inserted, vec!["c".to_string()]);
        assert_eq!(update.deleted, BTreeMap::from([(1, "a".to_string())]));
    }

    #[test]
    fn empty_current_inserts_everything() {
        let update = reconcile_attachments(&[], &names(&["x"]));
        assert_eq!(update.inserted, vec!["x".to_string()]);
        assert!(update.deleted.is_empty());
    }

    #[test]
    fn empty_desired_deletes_everything() {
        let current = vec![att(1, "a")];
        let update = reconcile_attachments(&current, &[]);
        assert!(update.inserted.is_empty());
        assert_eq!(update.deleted_ids(), vec![1]);
        assert_eq!(update.deleted_names(), vec!["a".to_string()]);
    }

    #[test]
    fn unchanged_set_is_empty() {
        let current = vec![att(1, "a"), att(2, "b")];
        let update = reconcile_attachments(&current, &names(&["a", "b"]));
        assert!(update.is_empty());
    }

    #[test]
    fn nothing_to_nothing_is_empty() {
        let update = reconcile_attachments(&[], &[]);
        assert!(update.inserted.is_empty());
        assert!(update.deleted.is_empty());
        assert!(update.is_empty());
    }

    #[test]
    fn repeated_desired_names_insert_once() {
        let current = vec![att(1, "a")];
        let update = reconcile_attachments(&current, &names(&["a", "a", "c", "c"]));
        assert_eq!(update.inserted, vec!["c".to_string()]);
        assert!(update.deleted.is_empty());
    }
}
