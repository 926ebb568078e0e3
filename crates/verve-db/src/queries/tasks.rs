//! SQL for the `tasks` table.
//!
//! Conditional transitions use optimistic locking: the UPDATE's WHERE clause
//! includes the required status, and the affected-row count tells the caller
//! whether the predicate matched. No read-modify-write loops.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Task, TaskStatus};
use crate::store::{StartOver, TaskUpdate};

/// Insert a new task row. The caller fills in every field so both backends
/// agree on the stored values.
pub async fn insert_task(pool: &PgPool, task: &Task) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO tasks (id, repo_id, epic_id, title, description, acceptance_criteria, \
                            depends_on, status, ready, attempt, max_attempts, retry_reason, \
                            retry_context, consecutive_failures, cost_usd, max_cost_usd, \
                            skip_pr, model, pr_url, pr_number, branch_name, close_reason, \
                            agent_status, started_at, last_heartbeat_at, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)",
    )
    .bind(&task.id)
    .bind(&task.repo_id)
    .bind(&task.epic_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.acceptance_criteria)
    .bind(&task.depends_on)
    .bind(task.status)
    .bind(task.ready)
    .bind(task.attempt)
    .bind(task.max_attempts)
    .bind(&task.retry_reason)
    .bind(&task.retry_context)
    .bind(task.consecutive_failures)
    .bind(task.cost_usd)
    .bind(task.max_cost_usd)
    .bind(task.skip_pr)
    .bind(&task.model)
    .bind(&task.pr_url)
    .bind(task.pr_number)
    .bind(&task.branch_name)
    .bind(&task.close_reason)
    .bind(&task.agent_status)
    .bind(task.started_at)
    .bind(task.last_heartbeat_at)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks, newest first.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// List all tasks for a repository, newest first.
pub async fn list_tasks_by_repo(pool: &PgPool, repo_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE repo_id = $1 ORDER BY created_at DESC",
    )
    .bind(repo_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for repo")?;

    Ok(tasks)
}

/// List all tasks attached to an epic, in creation order.
pub async fn list_tasks_by_epic(pool: &PgPool, epic_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE epic_id = $1 ORDER BY created_at ASC",
    )
    .bind(epic_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for epic")?;

    Ok(tasks)
}

/// Pending tasks in creation order. This is the claim scan order, so older
/// tasks win ties.
pub async fn list_pending(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'pending' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// Pending tasks restricted to a set of repositories, in creation order.
pub async fn list_pending_by_repos(pool: &PgPool, repo_ids: &[String]) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'pending' AND repo_id = ANY($1) \
         ORDER BY created_at ASC",
    )
    .bind(repo_ids)
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks for repos")?;

    Ok(tasks)
}

/// Tasks awaiting a review outcome.
pub async fn list_in_review(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'review' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list in-review tasks")?;

    Ok(tasks)
}

/// Tasks in review with no PR recorded yet (branch-only / skip-pr runs).
pub async fn list_in_review_no_pr(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'review' AND pr_number = 0 \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list in-review tasks without PR")?;

    Ok(tasks)
}

/// Running tasks whose most recent sign of life is older than `cutoff`.
pub async fn list_stale(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' \
           AND COALESCE(last_heartbeat_at, started_at, created_at) < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale tasks")?;

    Ok(tasks)
}

/// Fetch just the status of a task.
pub async fn get_status(pool: &PgPool, id: &str) -> Result<Option<TaskStatus>> {
    let row: Option<(TaskStatus,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task status")?;

    Ok(row.map(|(s,)| s))
}

/// Whether a task row exists.
pub async fn task_exists(pool: &PgPool, id: &str) -> Result<bool> {
    let row: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("failed to check task existence")?;

    Ok(row.0)
}

/// Whether any task targets the repository.
pub async fn has_tasks_for_repo(pool: &PgPool, repo_id: &str) -> Result<bool> {
    let row: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE repo_id = $1)")
        .bind(repo_id)
        .fetch_one(pool)
        .await
        .context("failed to check tasks for repo")?;

    Ok(row.0)
}

// -----------------------------------------------------------------------
// Plain updates
// -----------------------------------------------------------------------

pub async fn set_pr(pool: &PgPool, id: &str, url: &str, number: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET pr_url = $2, pr_number = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(url)
    .bind(number)
    .execute(pool)
    .await
    .context("failed to set task PR")?;

    Ok(result.rows_affected())
}

pub async fn set_branch(pool: &PgPool, id: &str, name: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET branch_name = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await
            .context("failed to set task branch")?;

    Ok(result.rows_affected())
}

pub async fn set_agent_status(pool: &PgPool, id: &str, status: &serde_json::Value) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET agent_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(pool)
            .await
            .context("failed to set agent status")?;

    Ok(result.rows_affected())
}

pub async fn set_retry_context(pool: &PgPool, id: &str, context: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET retry_context = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(context)
            .execute(pool)
            .await
            .context("failed to set retry context")?;

    Ok(result.rows_affected())
}

pub async fn set_close_reason(pool: &PgPool, id: &str, reason: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET close_reason = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(pool)
            .await
            .context("failed to set close reason")?;

    Ok(result.rows_affected())
}

pub async fn add_cost(pool: &PgPool, id: &str, delta: f64) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET cost_usd = cost_usd + $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(delta)
            .execute(pool)
            .await
            .context("failed to add task cost")?;

    Ok(result.rows_affected())
}

pub async fn set_consecutive_failures(pool: &PgPool, id: &str, n: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET consecutive_failures = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(n)
    .execute(pool)
    .await
    .context("failed to set consecutive failures")?;

    Ok(result.rows_affected())
}

pub async fn set_ready(pool: &PgPool, id: &str, ready: bool) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET ready = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(ready)
        .execute(pool)
        .await
        .context("failed to set ready flag")?;

    Ok(result.rows_affected())
}

/// Refresh the heartbeat timestamp while the task is still running. Zero
/// rows affected means the worker should cancel.
pub async fn heartbeat(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET last_heartbeat_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Apply authored-field updates while the task is still `pending`.
pub async fn update_pending(pool: &PgPool, id: &str, update: &TaskUpdate) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET title = COALESCE($2, title), \
             description = COALESCE($3, description), \
             acceptance_criteria = COALESCE($4, acceptance_criteria), \
             depends_on = COALESCE($5, depends_on), \
             max_attempts = COALESCE($6, max_attempts), \
             max_cost_usd = COALESCE($7, max_cost_usd), \
             model = COALESCE($8, model), \
             skip_pr = COALESCE($9, skip_pr), \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(&update.title)
    .bind(&update.description)
    .bind(&update.acceptance_criteria)
    .bind(&update.depends_on)
    .bind(update.max_attempts)
    .bind(update.max_cost_usd)
    .bind(&update.model)
    .bind(update.skip_pr)
    .execute(pool)
    .await
    .context("failed to update pending task")?;

    Ok(result.rows_affected())
}

pub async fn remove_dependency(pool: &PgPool, id: &str, dep_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET depends_on = array_remove(depends_on, $2), updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(dep_id)
    .execute(pool)
    .await
    .context("failed to remove dependency")?;

    Ok(result.rows_affected())
}

/// Delete a task along with its logs (FK cascade) and scrub its id from
/// every other task's `depends_on` list.
pub async fn delete_task(pool: &PgPool, id: &str) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin delete")?;

    sqlx::query(
        "UPDATE tasks SET depends_on = array_remove(depends_on, $1), updated_at = NOW() \
         WHERE $1 = ANY(depends_on)",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to scrub dependency back-references")?;

    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to delete task")?;

    tx.commit().await.context("failed to commit delete")?;

    Ok(result.rows_affected())
}

pub async fn clear_epic_id_for_tasks(pool: &PgPool, epic_id: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET epic_id = NULL, updated_at = NOW() WHERE epic_id = $1")
            .bind(epic_id)
            .execute(pool)
            .await
            .context("failed to clear epic id")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Conditional state transitions
// -----------------------------------------------------------------------

/// `pending -> running`. The worker that wins this CAS owns the attempt.
pub async fn claim(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', \
             started_at = NOW(), \
             last_heartbeat_at = NOW(), \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// `review -> pending` with an incremented attempt. PR/branch fields are
/// untouched so the next attempt continues on the same branch.
pub async fn retry_from_review(pool: &PgPool, id: &str, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempt = attempt + 1, \
             retry_reason = $2, \
             started_at = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'review'",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await
    .context("failed to retry task from review")?;

    Ok(result.rows_affected())
}

/// `failed -> pending`, operator-initiated. Resets the breaker counter and
/// clears the failure bookkeeping; preserves pr_url/pr_number/branch_name.
pub async fn manual_retry(pool: &PgPool, id: &str, instructions: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempt = attempt + 1, \
             consecutive_failures = 0, \
             retry_reason = $2, \
             retry_context = '', \
             close_reason = '', \
             started_at = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'failed'",
    )
    .bind(id)
    .bind(instructions)
    .execute(pool)
    .await
    .context("failed to manually retry task")?;

    Ok(result.rows_affected())
}

/// `review -> pending` for user feedback and merge-conflict retries. Both
/// counters move together so the remaining retry budget is preserved.
pub async fn feedback_retry(pool: &PgPool, id: &str, feedback: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempt = attempt + 1, \
             max_attempts = max_attempts + 1, \
             consecutive_failures = 0, \
             retry_reason = $2, \
             started_at = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'review'",
    )
    .bind(id)
    .bind(feedback)
    .execute(pool)
    .await
    .context("failed to apply feedback retry")?;

    Ok(result.rows_affected())
}

/// `running -> pending`, used when the agent hit a rate limit mid-run.
pub async fn schedule_retry_from_running(pool: &PgPool, id: &str, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempt = attempt + 1, \
             retry_reason = $2, \
             started_at = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await
    .context("failed to schedule retry from running")?;

    Ok(result.rows_affected())
}

/// `running -> pending` with `ready = false`: an operator interrupt. The
/// task will not be re-claimed until it is marked ready again.
pub async fn stop(pool: &PgPool, id: &str, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             ready = FALSE, \
             close_reason = $2, \
             started_at = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await
    .context("failed to stop task")?;

    Ok(result.rows_affected())
}

/// Reset to a fresh `pending` from any state. Log rows are deleted by the
/// caller; everything else is cleared here in one statement.
pub async fn start_over(pool: &PgPool, id: &str, params: &StartOver) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             ready = TRUE, \
             attempt = 1, \
             retry_reason = '', \
             retry_context = '', \
             consecutive_failures = 0, \
             cost_usd = 0, \
             pr_url = '', \
             pr_number = 0, \
             branch_name = '', \
             close_reason = '', \
             agent_status = NULL, \
             started_at = NULL, \
             last_heartbeat_at = NULL, \
             title = COALESCE($2, title), \
             description = COALESCE($3, description), \
             acceptance_criteria = COALESCE($4, acceptance_criteria), \
             updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(&params.title)
    .bind(&params.description)
    .bind(&params.acceptance_criteria)
    .execute(pool)
    .await
    .context("failed to start task over")?;

    Ok(result.rows_affected())
}

/// Generic status CAS used for the report/sync/close arcs.
pub async fn transition(
    pool: &PgPool,
    id: &str,
    allowed_from: &[TaskStatus],
    to: TaskStatus,
) -> Result<u64> {
    let from: Vec<String> = allowed_from.iter().map(ToString::to_string).collect();
    let result = sqlx::query(
        "UPDATE tasks SET status = $2, updated_at = NOW() \
         WHERE id = $1 AND status = ANY($3)",
    )
    .bind(id)
    .bind(to)
    .bind(&from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition task {id} to {to}"))?;

    Ok(result.rows_affected())
}
