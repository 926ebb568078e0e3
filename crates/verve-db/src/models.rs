//! Row types and enums shared by both store backends.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Prefix carried by every task id.
pub const TASK_ID_PREFIX: &str = "tsk-";

/// Generate a fresh task id (`tsk-<32 hex chars>`).
pub fn new_task_id() -> String {
    format!("{}{}", TASK_ID_PREFIX, Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Review,
    Merged,
    Closed,
    Failed,
}

impl TaskStatus {
    /// Terminal states. `failed` is sticky but not terminal: it can still be
    /// manually retried or started over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Closed)
    }

    /// Whether a task in this state satisfies another task's dependency.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Merged | Self::Closed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Review => "review",
            Self::Merged => "merged",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "review" => Ok(Self::Review),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one unit of agentic work scoped to a single repository.
///
/// `depends_on` gates claiming: the task is only eligible once every listed
/// task has reached `merged` or `closed`. `pr_url`/`pr_number`/`branch_name`
/// are populated by the worker once the agent publishes output and survive
/// retries so follow-up attempts push to the same branch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub repo_id: String,
    pub epic_id: Option<String>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub ready: bool,
    pub attempt: i32,
    pub max_attempts: i32,
    pub retry_reason: String,
    pub retry_context: String,
    pub consecutive_failures: i32,
    pub cost_usd: f64,
    pub max_cost_usd: f64,
    pub skip_pr: bool,
    pub model: String,
    pub pr_url: String,
    pub pr_number: i32,
    pub branch_name: String,
    pub close_reason: String,
    pub agent_status: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the agent has published any output for this task.
    pub fn has_output(&self) -> bool {
        self.pr_number > 0 || !self.branch_name.is_empty()
    }
}

/// One append-only batch of log lines from a worker attempt.
///
/// Batches are immutable once written; readers stream them in
/// `(attempt, seq)` order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskLogBatch {
    pub id: i64,
    pub task_id: String,
    pub attempt: i32,
    pub seq: i32,
    pub lines: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Review,
            TaskStatus::Merged,
            TaskStatus::Closed,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Merged.is_terminal());
        assert!(TaskStatus::Closed.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Review.is_terminal());
    }

    #[test]
    fn task_id_has_prefix() {
        let id = new_task_id();
        assert!(id.starts_with(TASK_ID_PREFIX));
        assert_eq!(id.len(), TASK_ID_PREFIX.len() + 32);
    }
}
