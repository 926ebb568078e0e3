//! Ephemeral state-change and log-append events.
//!
//! Events carry enough context for a dashboard to update incrementally;
//! they are not persisted. A subscriber that misses events re-reads task
//! state through the store.

pub mod broker;

use serde::{Deserialize, Serialize};

use verve_db::models::Task;

pub use broker::{EventBroker, Notifier, SUBSCRIBER_BUFFER};

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    LogsAppended,
    TaskDeleted,
}

impl EventType {
    /// Wire name, also used as the SSE event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::LogsAppended => "logs_appended",
            Self::TaskDeleted => "task_deleted",
        }
    }
}

/// One event on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub repo_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

impl Event {
    pub fn task_created(task: &Task) -> Self {
        Self {
            event_type: EventType::TaskCreated,
            repo_id: task.repo_id.clone(),
            task_id: task.id.clone(),
            task: Some(task.clone()),
            logs: None,
            attempt: None,
        }
    }

    pub fn task_updated(task: &Task) -> Self {
        Self {
            event_type: EventType::TaskUpdated,
            repo_id: task.repo_id.clone(),
            task_id: task.id.clone(),
            task: Some(task.clone()),
            logs: None,
            attempt: None,
        }
    }

    pub fn logs_appended(repo_id: &str, task_id: &str, attempt: i32, lines: Vec<String>) -> Self {
        Self {
            event_type: EventType::LogsAppended,
            repo_id: repo_id.to_owned(),
            task_id: task_id.to_owned(),
            task: None,
            logs: Some(lines),
            attempt: Some(attempt),
        }
    }

    pub fn task_deleted(repo_id: &str, task_id: &str) -> Self {
        Self {
            event_type: EventType::TaskDeleted,
            repo_id: repo_id.to_owned(),
            task_id: task_id.to_owned(),
            task: None,
            logs: None,
            attempt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::TaskCreated.as_str(), "task_created");
        assert_eq!(EventType::LogsAppended.as_str(), "logs_appended");
    }

    #[test]
    fn event_json_elides_empty_fields() {
        let event = Event::task_deleted("acme/widgets", "tsk-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_deleted");
        assert_eq!(json["task_id"], "tsk-1");
        assert!(json.get("task").is_none());
        assert!(json.get("logs").is_none());
    }

    #[test]
    fn logs_event_roundtrip() {
        let event = Event::logs_appended("r", "tsk-2", 3, vec!["a".into(), "b".into()]);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, EventType::LogsAppended);
        assert_eq!(back.attempt, Some(3));
        assert_eq!(back.logs.as_deref(), Some(&["a".to_owned(), "b".to_owned()][..]));
    }
}
