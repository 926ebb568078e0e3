//! SQL for the `task_logs` table.
//!
//! Log batches are append-only. `seq` is assigned server-side as max+1
//! within `(task_id, attempt)`; a single worker owns each attempt, so
//! appends for one attempt never race each other.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::TaskLogBatch;

/// Append one batch of lines for a task attempt.
///
/// Surfaces the raw sqlx error so the caller can map a foreign-key
/// violation (task deleted concurrently) to a silent drop.
pub async fn append_logs(
    pool: &PgPool,
    task_id: &str,
    attempt: i32,
    lines: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO task_logs (task_id, attempt, seq, lines) \
         SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, $3 \
         FROM task_logs WHERE task_id = $1 AND attempt = $2",
    )
    .bind(task_id)
    .bind(attempt)
    .bind(lines)
    .execute(pool)
    .await?;

    Ok(())
}

/// All log batches for a task, streamed in `(attempt, seq)` order.
pub async fn list_logs(pool: &PgPool, task_id: &str) -> Result<Vec<TaskLogBatch>> {
    let batches = sqlx::query_as::<_, TaskLogBatch>(
        "SELECT * FROM task_logs \
         WHERE task_id = $1 \
         ORDER BY attempt ASC, seq ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list logs for task {task_id}"))?;

    Ok(batches)
}

/// Delete all log batches for a task (the start-over path; normal deletes
/// go through the FK cascade).
pub async fn delete_logs(pool: &PgPool, task_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_logs WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete logs for task {task_id}"))?;

    Ok(result.rows_affected())
}
