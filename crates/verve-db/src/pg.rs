//! Postgres-backed [`TaskStore`].
//!
//! A thin wrapper binding the trait to the SQL in [`crate::queries`]; every
//! conditional transition is a single optimistic-locking UPDATE there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Task, TaskLogBatch, TaskStatus};
use crate::queries::{task_logs, tasks};
use crate::store::{StartOver, StoreError, StoreResult, TaskStore, TaskUpdate};

/// The production store. Clone is cheap (pool handle).
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool (for the notify bridge and migrations).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Whether a sqlx error is a unique-constraint violation (SQLSTATE 23505).
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Whether a sqlx error is a foreign-key violation (SQLSTATE 23503).
fn is_fk_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503"))
}

/// Map "zero rows touched" on an unconditional update to `NotFound`.
fn require_row(rows: u64) -> StoreResult<()> {
    if rows == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn get(&self, id: &str) -> StoreResult<Task> {
        tasks::get_task(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_tasks(&self.pool).await?)
    }

    async fn list_by_repo(&self, repo_id: &str) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_tasks_by_repo(&self.pool, repo_id).await?)
    }

    async fn list_by_epic(&self, epic_id: &str) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_tasks_by_epic(&self.pool, epic_id).await?)
    }

    async fn list_pending(&self) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_pending(&self.pool).await?)
    }

    async fn list_pending_by_repos(&self, repo_ids: &[String]) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_pending_by_repos(&self.pool, repo_ids).await?)
    }

    async fn list_in_review(&self) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_in_review(&self.pool).await?)
    }

    async fn list_in_review_no_pr(&self) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_in_review_no_pr(&self.pool).await?)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_stale(&self.pool, cutoff).await?)
    }

    async fn status_of(&self, id: &str) -> StoreResult<TaskStatus> {
        tasks::get_status(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(tasks::task_exists(&self.pool, id).await?)
    }

    async fn has_tasks_for_repo(&self, repo_id: &str) -> StoreResult<bool> {
        Ok(tasks::has_tasks_for_repo(&self.pool, repo_id).await?)
    }

    async fn list_logs(&self, id: &str) -> StoreResult<Vec<TaskLogBatch>> {
        Ok(task_logs::list_logs(&self.pool, id).await?)
    }

    async fn create(&self, task: &Task) -> StoreResult<()> {
        match tasks::insert_task(&self.pool, task).await {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            ))),
            Err(e) => Err(StoreError::Internal(e.into())),
        }
    }

    async fn append_logs(&self, id: &str, attempt: i32, lines: &[String]) -> StoreResult<bool> {
        match task_logs::append_logs(&self.pool, id, attempt, lines).await {
            Ok(()) => Ok(true),
            // Task deleted out from under the worker: drop the batch.
            Err(e) if is_fk_violation(&e) => Ok(false),
            Err(e) => Err(StoreError::Internal(e.into())),
        }
    }

    async fn set_pr(&self, id: &str, url: &str, number: i32) -> StoreResult<()> {
        require_row(tasks::set_pr(&self.pool, id, url, number).await?)
    }

    async fn set_branch(&self, id: &str, name: &str) -> StoreResult<()> {
        require_row(tasks::set_branch(&self.pool, id, name).await?)
    }

    async fn set_agent_status(&self, id: &str, status: &serde_json::Value) -> StoreResult<()> {
        require_row(tasks::set_agent_status(&self.pool, id, status).await?)
    }

    async fn set_retry_context(&self, id: &str, context: &str) -> StoreResult<()> {
        require_row(tasks::set_retry_context(&self.pool, id, context).await?)
    }

    async fn set_close_reason(&self, id: &str, reason: &str) -> StoreResult<()> {
        require_row(tasks::set_close_reason(&self.pool, id, reason).await?)
    }

    async fn add_cost(&self, id: &str, delta: f64) -> StoreResult<()> {
        require_row(tasks::add_cost(&self.pool, id, delta).await?)
    }

    async fn set_consecutive_failures(&self, id: &str, n: i32) -> StoreResult<()> {
        require_row(tasks::set_consecutive_failures(&self.pool, id, n).await?)
    }

    async fn set_ready(&self, id: &str, ready: bool) -> StoreResult<()> {
        require_row(tasks::set_ready(&self.pool, id, ready).await?)
    }

    async fn heartbeat(&self, id: &str) -> StoreResult<bool> {
        Ok(tasks::heartbeat(&self.pool, id).await? > 0)
    }

    async fn update_pending(&self, id: &str, update: &TaskUpdate) -> StoreResult<bool> {
        Ok(tasks::update_pending(&self.pool, id, update).await? > 0)
    }

    async fn remove_dependency(&self, id: &str, dep_id: &str) -> StoreResult<()> {
        require_row(tasks::remove_dependency(&self.pool, id, dep_id).await?)
    }

    async fn delete_logs(&self, id: &str) -> StoreResult<()> {
        task_logs::delete_logs(&self.pool, id).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_row(tasks::delete_task(&self.pool, id).await?)
    }

    async fn clear_epic_id_for_tasks(&self, epic_id: &str) -> StoreResult<u64> {
        Ok(tasks::clear_epic_id_for_tasks(&self.pool, epic_id).await?)
    }

    async fn claim(&self, id: &str) -> StoreResult<bool> {
        Ok(tasks::claim(&self.pool, id).await? > 0)
    }

    async fn retry_from_review(&self, id: &str, reason: &str) -> StoreResult<bool> {
        Ok(tasks::retry_from_review(&self.pool, id, reason).await? > 0)
    }

    async fn manual_retry(&self, id: &str, instructions: &str) -> StoreResult<bool> {
        Ok(tasks::manual_retry(&self.pool, id, instructions).await? > 0)
    }

    async fn feedback_retry(&self, id: &str, feedback: &str) -> StoreResult<bool> {
        Ok(tasks::feedback_retry(&self.pool, id, feedback).await? > 0)
    }

    async fn schedule_retry_from_running(&self, id: &str, reason: &str) -> StoreResult<bool> {
        Ok(tasks::schedule_retry_from_running(&self.pool, id, reason).await? > 0)
    }

    async fn stop(&self, id: &str, reason: &str) -> StoreResult<bool> {
        Ok(tasks::stop(&self.pool, id, reason).await? > 0)
    }

    async fn start_over(&self, id: &str, params: &StartOver) -> StoreResult<bool> {
        Ok(tasks::start_over(&self.pool, id, params).await? > 0)
    }

    async fn transition(
        &self,
        id: &str,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
    ) -> StoreResult<bool> {
        Ok(tasks::transition(&self.pool, id, allowed_from, to).await? > 0)
    }
}
