//! In-memory [`TaskStore`] for development and service-level tests.
//!
//! A single mutex guards the whole map, so every operation -- including the
//! conditional transitions -- is atomic and observes the same semantics as
//! the Postgres backend's single-statement UPDATEs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Task, TaskLogBatch, TaskStatus};
use crate::store::{StartOver, StoreError, StoreResult, TaskStore, TaskUpdate};

#[derive(Default)]
struct MemInner {
    tasks: HashMap<String, Task>,
    logs: Vec<TaskLogBatch>,
    next_log_id: i64,
}

/// The development backend. Nothing survives process exit.
#[derive(Default)]
pub struct MemTaskStore {
    inner: Mutex<MemInner>,
}

impl MemTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_desc(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    tasks
}

fn sorted_asc(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    tasks
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn get(&self, id: &str) -> StoreResult<Task> {
        let inner = self.inner.lock().unwrap();
        inner.tasks.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_desc(inner.tasks.values().cloned().collect()))
    }

    async fn list_by_repo(&self, repo_id: &str) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_desc(
            inner
                .tasks
                .values()
                .filter(|t| t.repo_id == repo_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_epic(&self, epic_id: &str) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_asc(
            inner
                .tasks
                .values()
                .filter(|t| t.epic_id.as_deref() == Some(epic_id))
                .cloned()
                .collect(),
        ))
    }

    async fn list_pending(&self) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_asc(
            inner
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .cloned()
                .collect(),
        ))
    }

    async fn list_pending_by_repos(&self, repo_ids: &[String]) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_asc(
            inner
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Pending && repo_ids.iter().any(|r| *r == t.repo_id)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn list_in_review(&self) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_asc(
            inner
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Review)
                .cloned()
                .collect(),
        ))
    }

    async fn list_in_review_no_pr(&self) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_asc(
            inner
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Review && t.pr_number == 0)
                .cloned()
                .collect(),
        ))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.last_heartbeat_at
                        .or(t.started_at)
                        .unwrap_or(t.created_at)
                        < cutoff
            })
            .cloned()
            .collect())
    }

    async fn status_of(&self, id: &str) -> StoreResult<TaskStatus> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or(StoreError::NotFound)
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.contains_key(id))
    }

    async fn has_tasks_for_repo(&self, repo_id: &str) -> StoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.values().any(|t| t.repo_id == repo_id))
    }

    async fn list_logs(&self, id: &str) -> StoreResult<Vec<TaskLogBatch>> {
        let inner = self.inner.lock().unwrap();
        let mut batches: Vec<TaskLogBatch> = inner
            .logs
            .iter()
            .filter(|b| b.task_id == id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.attempt, b.seq));
        Ok(batches)
    }

    async fn create(&self, task: &Task) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn append_logs(&self, id: &str, attempt: i32, lines: &[String]) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tasks.contains_key(id) {
            return Ok(false);
        }
        let seq = inner
            .logs
            .iter()
            .filter(|b| b.task_id == id && b.attempt == attempt)
            .map(|b| b.seq)
            .max()
            .unwrap_or(0)
            + 1;
        inner.next_log_id += 1;
        let batch = TaskLogBatch {
            id: inner.next_log_id,
            task_id: id.to_owned(),
            attempt,
            seq,
            lines: lines.to_vec(),
            created_at: Utc::now(),
        };
        inner.logs.push(batch);
        Ok(true)
    }

    async fn set_pr(&self, id: &str, url: &str, number: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.pr_url = url.to_owned();
        task.pr_number = number;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_branch(&self, id: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.branch_name = name.to_owned();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_agent_status(&self, id: &str, status: &serde_json::Value) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.agent_status = Some(status.clone());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_retry_context(&self, id: &str, context: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.retry_context = context.to_owned();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_close_reason(&self, id: &str, reason: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.close_reason = reason.to_owned();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn add_cost(&self, id: &str, delta: f64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.cost_usd += delta;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_consecutive_failures(&self, id: &str, n: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.consecutive_failures = n;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_ready(&self, id: &str, ready: bool) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.ready = ready;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn heartbeat(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.last_heartbeat_at = Some(Utc::now());
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_pending(&self, id: &str, update: &TaskUpdate) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        if let Some(v) = &update.title {
            task.title = v.clone();
        }
        if let Some(v) = &update.description {
            task.description = v.clone();
        }
        if let Some(v) = &update.acceptance_criteria {
            task.acceptance_criteria = v.clone();
        }
        if let Some(v) = &update.depends_on {
            task.depends_on = v.clone();
        }
        if let Some(v) = update.max_attempts {
            task.max_attempts = v;
        }
        if let Some(v) = update.max_cost_usd {
            task.max_cost_usd = v;
        }
        if let Some(v) = &update.model {
            task.model = v.clone();
        }
        if let Some(v) = update.skip_pr {
            task.skip_pr = v;
        }
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn remove_dependency(&self, id: &str, dep_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(StoreError::NotFound)?;
        task.depends_on.retain(|d| d != dep_id);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_logs(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.logs.retain(|b| b.task_id != id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tasks.remove(id).is_none() {
            return Err(StoreError::NotFound);
        }
        inner.logs.retain(|b| b.task_id != id);
        for task in inner.tasks.values_mut() {
            if task.depends_on.iter().any(|d| d == id) {
                task.depends_on.retain(|d| d != id);
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn clear_epic_id_for_tasks(&self, epic_id: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut touched = 0;
        for task in inner.tasks.values_mut() {
            if task.epic_id.as_deref() == Some(epic_id) {
                task.epic_id = None;
                task.updated_at = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn claim(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.last_heartbeat_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn retry_from_review(&self, id: &str, reason: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Review {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.retry_reason = reason.to_owned();
        task.started_at = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn manual_retry(&self, id: &str, instructions: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Failed {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.consecutive_failures = 0;
        task.retry_reason = instructions.to_owned();
        task.retry_context.clear();
        task.close_reason.clear();
        task.started_at = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn feedback_retry(&self, id: &str, feedback: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Review {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.max_attempts += 1;
        task.consecutive_failures = 0;
        task.retry_reason = feedback.to_owned();
        task.started_at = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn schedule_retry_from_running(&self, id: &str, reason: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.retry_reason = reason.to_owned();
        task.started_at = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn stop(&self, id: &str, reason: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.ready = false;
        task.close_reason = reason.to_owned();
        task.started_at = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn start_over(&self, id: &str, params: &StartOver) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        task.status = TaskStatus::Pending;
        task.ready = true;
        task.attempt = 1;
        task.retry_reason.clear();
        task.retry_context.clear();
        task.consecutive_failures = 0;
        task.cost_usd = 0.0;
        task.pr_url.clear();
        task.pr_number = 0;
        task.branch_name.clear();
        task.close_reason.clear();
        task.agent_status = None;
        task.started_at = None;
        task.last_heartbeat_at = None;
        if let Some(v) = &params.title {
            task.title = v.clone();
        }
        if let Some(v) = &params.description {
            task.description = v.clone();
        }
        if let Some(v) = &params.acceptance_criteria {
            task.acceptance_criteria = v.clone();
        }
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition(
        &self,
        id: &str,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        if !allowed_from.contains(&task.status) {
            return Ok(false);
        }
        task.status = to;
        task.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::new_task_id;

    fn fresh_task() -> Task {
        let now = Utc::now();
        Task {
            id: new_task_id(),
            repo_id: "acme/widgets".to_owned(),
            epic_id: None,
            title: "add foo".to_owned(),
            description: "add the foo feature".to_owned(),
            acceptance_criteria: vec![],
            depends_on: vec![],
            status: TaskStatus::Pending,
            ready: true,
            attempt: 1,
            max_attempts: 5,
            retry_reason: String::new(),
            retry_context: String::new(),
            consecutive_failures: 0,
            cost_usd: 0.0,
            max_cost_usd: 0.0,
            skip_pr: false,
            model: String::new(),
            pr_url: String::new(),
            pr_number: 0,
            branch_name: String::new(),
            close_reason: String::new(),
            agent_status: None,
            started_at: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let store = MemTaskStore::new();
        let task = fresh_task();
        store.create(&task).await.unwrap();

        assert!(store.claim(&task.id).await.unwrap());
        assert!(!store.claim(&task.id).await.unwrap(), "second claim loses");

        let t = store.get(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.started_at.is_some());
        assert!(t.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = MemTaskStore::new();
        let task = fresh_task();
        store.create(&task).await.unwrap();
        let err = store.create(&task).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn manual_retry_preserves_pr_fields() {
        let store = MemTaskStore::new();
        let mut task = fresh_task();
        task.status = TaskStatus::Failed;
        task.pr_url = "https://x/pull/7".to_owned();
        task.pr_number = 7;
        task.branch_name = "verve/fix".to_owned();
        task.close_reason = "boom".to_owned();
        store.create(&task).await.unwrap();

        assert!(store.manual_retry(&task.id, "try again").await.unwrap());
        let t = store.get(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempt, 2);
        assert_eq!(t.pr_number, 7);
        assert_eq!(t.pr_url, "https://x/pull/7");
        assert_eq!(t.branch_name, "verve/fix");
        assert!(t.close_reason.is_empty());
        assert_eq!(t.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn feedback_retry_grows_both_counters() {
        let store = MemTaskStore::new();
        let mut task = fresh_task();
        task.status = TaskStatus::Review;
        task.attempt = 5;
        task.max_attempts = 5;
        store.create(&task).await.unwrap();

        assert!(store.feedback_retry(&task.id, "rebase please").await.unwrap());
        let t = store.get(&task.id).await.unwrap();
        assert_eq!(t.attempt, 6);
        assert_eq!(t.max_attempts, 6);
        assert_eq!(t.retry_reason, "rebase please");
    }

    #[tokio::test]
    async fn log_seq_is_monotone_per_attempt() {
        let store = MemTaskStore::new();
        let task = fresh_task();
        store.create(&task).await.unwrap();

        store
            .append_logs(&task.id, 1, &["a".into(), "b".into()])
            .await
            .unwrap();
        store.append_logs(&task.id, 1, &["c".into()]).await.unwrap();
        store.append_logs(&task.id, 2, &["d".into()]).await.unwrap();

        let batches = store.list_logs(&task.id).await.unwrap();
        let keys: Vec<(i32, i32)> = batches.iter().map(|b| (b.attempt, b.seq)).collect();
        assert_eq!(keys, vec![(1, 1), (1, 2), (2, 1)]);
    }

    #[tokio::test]
    async fn append_logs_for_missing_task_is_dropped() {
        let store = MemTaskStore::new();
        let ok = store.append_logs("tsk-gone", 1, &["x".into()]).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn delete_scrubs_back_references() {
        let store = MemTaskStore::new();
        let dep = fresh_task();
        let mut dependent = fresh_task();
        dependent.depends_on = vec![dep.id.clone()];
        store.create(&dep).await.unwrap();
        store.create(&dependent).await.unwrap();

        store.delete(&dep.id).await.unwrap();
        let t = store.get(&dependent.id).await.unwrap();
        assert!(t.depends_on.is_empty());
    }

    #[tokio::test]
    async fn start_over_resets_everything() {
        let store = MemTaskStore::new();
        let mut task = fresh_task();
        task.status = TaskStatus::Failed;
        task.attempt = 4;
        task.cost_usd = 1.25;
        task.pr_number = 3;
        task.pr_url = "https://x/pull/3".to_owned();
        store.create(&task).await.unwrap();
        store.append_logs(&task.id, 1, &["old".into()]).await.unwrap();

        assert!(
            store
                .start_over(
                    &task.id,
                    &StartOver {
                        title: Some("take two".to_owned()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        );
        store.delete_logs(&task.id).await.unwrap();

        let t = store.get(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.ready);
        assert_eq!(t.attempt, 1);
        assert_eq!(t.cost_usd, 0.0);
        assert_eq!(t.pr_number, 0);
        assert_eq!(t.title, "take two");
        assert!(store.list_logs(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_false_when_not_running() {
        let store = MemTaskStore::new();
        let task = fresh_task();
        store.create(&task).await.unwrap();

        assert!(!store.heartbeat(&task.id).await.unwrap());
        store.claim(&task.id).await.unwrap();
        assert!(store.heartbeat(&task.id).await.unwrap());
        assert!(!store.heartbeat("tsk-missing").await.unwrap());
    }
}
