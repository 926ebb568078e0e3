//! The `TaskStore` trait: the persistence contract both backends honor.
//!
//! Conditional transitions are compare-and-swap operations: a single atomic
//! update guarded by a status predicate, returning `false` when the row did
//! not match. Callers decide whether a `false` is a lost race (normal) or a
//! precondition violation (caller error); the store never errors on a no-op
//! transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{Task, TaskLogBatch, TaskStatus};

/// Store error taxonomy. Transport errors pass through as `Internal`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Field updates allowed while a task is still `pending`.
///
/// `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
    pub max_attempts: Option<i32>,
    pub max_cost_usd: Option<f64>,
    pub model: Option<String>,
    pub skip_pr: Option<bool>,
}

/// Replacement content applied by `start_over`. `None` keeps the current
/// value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartOver {
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
}

/// Durable persistence of task rows and append-only log batches.
///
/// Two implementations exist: [`crate::pg::PgTaskStore`] (production) and
/// [`crate::mem::MemTaskStore`] (development and service-level tests). The
/// semantics are identical; the Postgres backend expresses each conditional
/// transition as one `UPDATE ... WHERE status = ...`, the in-memory backend
/// holds a mutex across the check-and-set.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // -- reads ------------------------------------------------------------

    async fn get(&self, id: &str) -> StoreResult<Task>;
    async fn list(&self) -> StoreResult<Vec<Task>>;
    async fn list_by_repo(&self, repo_id: &str) -> StoreResult<Vec<Task>>;
    async fn list_by_epic(&self, epic_id: &str) -> StoreResult<Vec<Task>>;
    /// Pending tasks in creation order (the claim scan order).
    async fn list_pending(&self) -> StoreResult<Vec<Task>>;
    async fn list_pending_by_repos(&self, repo_ids: &[String]) -> StoreResult<Vec<Task>>;
    async fn list_in_review(&self) -> StoreResult<Vec<Task>>;
    async fn list_in_review_no_pr(&self) -> StoreResult<Vec<Task>>;
    /// Running tasks whose last heartbeat is older than `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Task>>;
    async fn status_of(&self, id: &str) -> StoreResult<TaskStatus>;
    async fn exists(&self, id: &str) -> StoreResult<bool>;
    async fn has_tasks_for_repo(&self, repo_id: &str) -> StoreResult<bool>;
    /// All log batches for a task, ordered by `(attempt, seq)`.
    async fn list_logs(&self, id: &str) -> StoreResult<Vec<TaskLogBatch>>;

    // -- appends / updates ------------------------------------------------

    /// Insert a new task row. `Conflict` on duplicate id.
    async fn create(&self, task: &Task) -> StoreResult<()>;
    /// Append one log batch. Returns `false` when the task row is gone
    /// (deleted concurrently); the batch is dropped silently in that case.
    async fn append_logs(&self, id: &str, attempt: i32, lines: &[String]) -> StoreResult<bool>;
    async fn set_pr(&self, id: &str, url: &str, number: i32) -> StoreResult<()>;
    async fn set_branch(&self, id: &str, name: &str) -> StoreResult<()>;
    async fn set_agent_status(&self, id: &str, status: &serde_json::Value) -> StoreResult<()>;
    async fn set_retry_context(&self, id: &str, context: &str) -> StoreResult<()>;
    async fn set_close_reason(&self, id: &str, reason: &str) -> StoreResult<()>;
    async fn add_cost(&self, id: &str, delta: f64) -> StoreResult<()>;
    async fn set_consecutive_failures(&self, id: &str, n: i32) -> StoreResult<()>;
    async fn set_ready(&self, id: &str, ready: bool) -> StoreResult<()>;
    /// Refresh `last_heartbeat_at`. Returns `true` only while the task is
    /// still `running`; `false` tells the worker to cancel.
    async fn heartbeat(&self, id: &str) -> StoreResult<bool>;
    /// Apply field updates while the task is `pending`. Returns `false`
    /// when the status no longer matches.
    async fn update_pending(&self, id: &str, update: &TaskUpdate) -> StoreResult<bool>;
    async fn remove_dependency(&self, id: &str, dep_id: &str) -> StoreResult<()>;
    async fn delete_logs(&self, id: &str) -> StoreResult<()>;
    /// Delete the task, its logs, and every back-reference to it in other
    /// tasks' `depends_on` lists.
    async fn delete(&self, id: &str) -> StoreResult<()>;
    /// Detach all tasks from an epic. Returns the number of rows touched.
    async fn clear_epic_id_for_tasks(&self, epic_id: &str) -> StoreResult<u64>;

    // -- conditional state transitions ------------------------------------

    /// `pending -> running`; sets `started_at` and `last_heartbeat_at`.
    async fn claim(&self, id: &str) -> StoreResult<bool>;
    /// `review -> pending`; `attempt += 1`, records `retry_reason`, clears
    /// `started_at`.
    async fn retry_from_review(&self, id: &str, reason: &str) -> StoreResult<bool>;
    /// `failed -> pending`; `attempt += 1`, resets the breaker counter and
    /// clears `close_reason`/`retry_context`. PR/branch fields survive.
    async fn manual_retry(&self, id: &str, instructions: &str) -> StoreResult<bool>;
    /// `review -> pending`; increments both `attempt` and `max_attempts` so
    /// the retry budget is preserved. PR/branch fields survive.
    async fn feedback_retry(&self, id: &str, feedback: &str) -> StoreResult<bool>;
    /// `running -> pending`; the rate-limit requeue path.
    async fn schedule_retry_from_running(&self, id: &str, reason: &str) -> StoreResult<bool>;
    /// `running -> pending` with `ready = false`.
    async fn stop(&self, id: &str, reason: &str) -> StoreResult<bool>;
    /// Reset to a fresh `pending` from any state: `attempt = 1`, PR/branch/
    /// cost/agent_status cleared, provided content applied. Log deletion is
    /// the caller's follow-up via [`TaskStore::delete_logs`].
    async fn start_over(&self, id: &str, params: &StartOver) -> StoreResult<bool>;
    /// Generic status CAS: move to `to` if the current status is one of
    /// `allowed_from`.
    async fn transition(
        &self,
        id: &str,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
    ) -> StoreResult<bool>;
}
