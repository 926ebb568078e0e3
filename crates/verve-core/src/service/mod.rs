//! The task lifecycle service: business rules over the store.
//!
//! Every mutation goes through here so that state transitions stay inside
//! the allowed graph, retry policy is enforced in one place, and an event
//! is published for each change. Workers and the HTTP adapter never touch
//! the store directly.

pub mod retry;
pub mod sweeper;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use verve_db::models::{new_task_id, Task, TaskStatus};
use verve_db::store::{StartOver, StoreError, TaskStore, TaskUpdate};

use crate::event::{Event, EventBroker};
use retry::{decide_rate_limit_retry, decide_review_retry, RetryDecision, MERGE_CONFLICT_CATEGORY};

/// Default retry cap for new tasks.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Hard cap on the claim long-poll.
pub const CLAIM_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// A running task with no heartbeat for this long is considered stalled.
pub const STALE_AFTER: Duration = Duration::from_secs(180);

/// Upper bound on stored `retry_context` (CI log tail).
pub const RETRY_CONTEXT_MAX_BYTES: usize = 4096;

/// Service error taxonomy; the HTTP adapter maps these onto status codes.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Invalid(msg) => Self::Invalid(msg),
            StoreError::Internal(e) => Self::Internal(e),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Input for task creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub epic_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub skip_pr: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub ready: Option<bool>,
}

/// A worker's end-of-attempt report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionReport {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub pr_url: String,
    #[serde(default)]
    pub pr_number: i32,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub agent_status: Option<serde_json::Value>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub prereq_failed: String,
    #[serde(default)]
    pub no_changes: bool,
    #[serde(default)]
    pub retryable: bool,
}

/// Whether `from -> to` is an arc of the task state machine. Start-over is
/// a reset, not a transition, and is deliberately absent.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Closed)
            | (Running, Review)
            | (Running, Closed)
            | (Running, Failed)
            | (Running, Pending)
            | (Review, Merged)
            | (Review, Pending)
            | (Review, Closed)
            | (Review, Failed)
            | (Failed, Pending)
            | (Failed, Closed)
    )
}

/// Keep at most `max` bytes from the end of `s`, respecting char
/// boundaries. CI log tails are more useful than heads.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// The lifecycle service.
///
/// Thread-safe: all state lives in the store; the only in-process shared
/// state is the pending-available signal that wakes long-pollers.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    broker: Arc<EventBroker>,
    pending: Notify,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<EventBroker>) -> Self {
        Self {
            store,
            broker,
            pending: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    /// Wake every claim long-poller. Best-effort: spurious wakes are fine,
    /// pollers re-check and go back to waiting.
    fn poke_pending(&self) {
        self.pending.notify_waiters();
    }

    async fn publish_updated(&self, id: &str) -> ServiceResult<Task> {
        let task = self.store.get(id).await?;
        self.broker.publish(Event::task_updated(&task)).await;
        Ok(task)
    }

    /// Fail a task with a close reason, from any of `from`. Returns whether
    /// the transition applied.
    async fn fail_with_reason(
        &self,
        id: &str,
        from: &[TaskStatus],
        reason: &str,
    ) -> ServiceResult<bool> {
        self.store.set_close_reason(id, reason).await?;
        Ok(self.store.transition(id, from, TaskStatus::Failed).await?)
    }

    // -- creation and authoring -------------------------------------------

    pub async fn create_task(&self, repo_id: &str, new: NewTask) -> ServiceResult<Task> {
        if repo_id.is_empty() {
            return Err(ServiceError::Invalid("repo_id must not be empty".into()));
        }
        if new.title.trim().is_empty() {
            return Err(ServiceError::Invalid("title must not be empty".into()));
        }
        if let Some(max) = new.max_attempts {
            if max < 1 {
                return Err(ServiceError::Invalid("max_attempts must be >= 1".into()));
            }
        }
        for dep in &new.depends_on {
            if !self.store.exists(dep).await? {
                return Err(ServiceError::Invalid(format!("unknown dependency {dep}")));
            }
        }

        let now = Utc::now();
        let task = Task {
            id: new_task_id(),
            repo_id: repo_id.to_owned(),
            epic_id: new.epic_id,
            title: new.title,
            description: new.description,
            acceptance_criteria: new.acceptance_criteria,
            depends_on: new.depends_on,
            status: TaskStatus::Pending,
            ready: new.ready.unwrap_or(true),
            attempt: 1,
            max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry_reason: String::new(),
            retry_context: String::new(),
            consecutive_failures: 0,
            cost_usd: 0.0,
            max_cost_usd: new.max_cost_usd.unwrap_or(0.0),
            skip_pr: new.skip_pr,
            model: new.model.unwrap_or_default(),
            pr_url: String::new(),
            pr_number: 0,
            branch_name: String::new(),
            close_reason: String::new(),
            agent_status: None,
            started_at: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.create(&task).await?;
        self.broker.publish(Event::task_created(&task)).await;
        self.poke_pending();
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> ServiceResult<Task> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_tasks(&self) -> ServiceResult<Vec<Task>> {
        Ok(self.store.list().await?)
    }

    pub async fn list_by_repo(&self, repo_id: &str) -> ServiceResult<Vec<Task>> {
        Ok(self.store.list_by_repo(repo_id).await?)
    }

    pub async fn list_by_epic(&self, epic_id: &str) -> ServiceResult<Vec<Task>> {
        Ok(self.store.list_by_epic(epic_id).await?)
    }

    pub async fn list_in_review(&self) -> ServiceResult<Vec<Task>> {
        Ok(self.store.list_in_review().await?)
    }

    pub async fn list_logs(&self, id: &str) -> ServiceResult<Vec<verve_db::models::TaskLogBatch>> {
        Ok(self.store.list_logs(id).await?)
    }

    /// Update authored fields of a task that is still `pending`.
    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> ServiceResult<Task> {
        if let Some(deps) = &update.depends_on {
            for dep in deps {
                if dep == id {
                    return Err(ServiceError::Invalid(
                        "task cannot depend on itself".into(),
                    ));
                }
                if !self.store.exists(dep).await? {
                    return Err(ServiceError::Invalid(format!("unknown dependency {dep}")));
                }
            }
            if self.reaches(deps, id).await? {
                return Err(ServiceError::Invalid("dependency cycle detected".into()));
            }
        }

        let applied = self.store.update_pending(id, &update).await?;
        if !applied {
            if self.store.exists(id).await? {
                return Err(ServiceError::Conflict(
                    "only pending tasks can be updated".into(),
                ));
            }
            return Err(ServiceError::NotFound);
        }
        self.poke_pending();
        self.publish_updated(id).await
    }

    /// Whether following `depends_on` edges starting from `deps` reaches
    /// `target`. Detects cycles before they deadlock the claim loop.
    async fn reaches(&self, deps: &[String], target: &str) -> ServiceResult<bool> {
        let mut stack: Vec<String> = deps.to_vec();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return Ok(true);
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.store.get(&id).await {
                Ok(task) => stack.extend(task.depends_on),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    pub async fn delete_task(&self, id: &str) -> ServiceResult<()> {
        let task = self.store.get(id).await?;
        self.store.delete(id).await?;
        self.broker
            .publish(Event::task_deleted(&task.repo_id, id))
            .await;
        // Dependents may have just become eligible.
        self.poke_pending();
        Ok(())
    }

    pub async fn set_ready(&self, id: &str, ready: bool) -> ServiceResult<Task> {
        self.store.set_ready(id, ready).await?;
        if ready {
            self.poke_pending();
        }
        self.publish_updated(id).await
    }

    pub async fn remove_dependency(&self, id: &str, dep_id: &str) -> ServiceResult<Task> {
        self.store.remove_dependency(id, dep_id).await?;
        self.poke_pending();
        self.publish_updated(id).await
    }

    pub async fn detach_epic(&self, epic_id: &str) -> ServiceResult<u64> {
        Ok(self.store.clear_epic_id_for_tasks(epic_id).await?)
    }

    // -- claim dispatch ---------------------------------------------------

    /// Claim the next eligible task, waiting up to `timeout` for one to
    /// appear. Returns `None` on deadline.
    ///
    /// Eligibility: `pending`, `ready`, and every dependency in a terminal
    /// success state. The per-task `claim` CAS resolves races between
    /// concurrent pollers; losing a CAS just moves the scan on.
    pub async fn claim(
        &self,
        repo_ids: Option<&[String]>,
        timeout: Duration,
    ) -> ServiceResult<Option<Task>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the wake-up before scanning so a poke that lands during
            // the scan is not lost.
            let notified = self.pending.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_claim(repo_ids).await? {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// One scan over the pending set. Returns the first task whose claim
    /// CAS succeeds.
    pub async fn try_claim(&self, repo_ids: Option<&[String]>) -> ServiceResult<Option<Task>> {
        let pending = match repo_ids {
            Some(ids) => self.store.list_pending_by_repos(ids).await?,
            None => self.store.list_pending().await?,
        };

        'candidates: for task in pending {
            if !task.ready {
                continue;
            }
            for dep in &task.depends_on {
                match self.store.status_of(dep).await {
                    Ok(status) if status.satisfies_dependency() => {}
                    Ok(_) => continue 'candidates,
                    // Deleted dependency: back-reference removal is in
                    // flight, treat as satisfied.
                    Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if self.store.claim(&task.id).await? {
                return Ok(Some(self.publish_updated(&task.id).await?));
            }
            // Lost the race to another worker; keep scanning.
        }
        Ok(None)
    }

    // -- worker callbacks -------------------------------------------------

    /// Ingest a log batch. A vanished task is not an error: the worker and
    /// a delete raced, and the batch is dropped.
    pub async fn append_logs(
        &self,
        id: &str,
        attempt: i32,
        lines: &[String],
    ) -> ServiceResult<()> {
        let task = match self.store.get(id).await {
            Ok(task) => task,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if self.store.append_logs(id, attempt, lines).await? {
            self.broker
                .publish(Event::logs_appended(
                    &task.repo_id,
                    id,
                    attempt,
                    lines.to_vec(),
                ))
                .await;
        }
        Ok(())
    }

    /// Record worker liveness. `false` means the task is no longer running
    /// and the worker must cancel.
    pub async fn heartbeat(&self, id: &str) -> ServiceResult<bool> {
        Ok(self.store.heartbeat(id).await?)
    }

    /// Process a worker's completion report (one call per attempt).
    pub async fn report_completion(
        &self,
        id: &str,
        report: &CompletionReport,
    ) -> ServiceResult<Task> {
        let task = self.store.get(id).await?;

        if let Some(status) = &report.agent_status {
            self.store.set_agent_status(id, status).await?;
        }
        if report.cost_usd > 0.0 {
            self.store.add_cost(id, report.cost_usd).await?;
        }

        let running = &[TaskStatus::Running][..];
        if !report.success && report.retryable && report.prereq_failed.is_empty() {
            self.schedule_rate_limit_retry(&task, report).await?;
        } else if !report.success && !report.prereq_failed.is_empty() {
            self.store.set_close_reason(id, &report.prereq_failed).await?;
            self.store.transition(id, running, TaskStatus::Failed).await?;
        } else if !report.success {
            if task.has_output() {
                // A retained open PR still needs attention.
                self.store.transition(id, running, TaskStatus::Review).await?;
            } else {
                if !report.error.is_empty() {
                    self.store.set_close_reason(id, &report.error).await?;
                }
                self.store.transition(id, running, TaskStatus::Failed).await?;
            }
        } else if !report.pr_url.is_empty() {
            self.store.set_pr(id, &report.pr_url, report.pr_number).await?;
            self.store.transition(id, running, TaskStatus::Review).await?;
        } else if !report.branch_name.is_empty() {
            self.store.set_branch(id, &report.branch_name).await?;
            self.store.transition(id, running, TaskStatus::Review).await?;
        } else if task.has_output() {
            self.store.transition(id, running, TaskStatus::Review).await?;
        } else if report.no_changes {
            self.store.set_close_reason(id, "No changes needed").await?;
            self.store.transition(id, running, TaskStatus::Closed).await?;
        } else {
            self.store.transition(id, running, TaskStatus::Closed).await?;
        }

        self.publish_updated(id).await
    }

    async fn schedule_rate_limit_retry(
        &self,
        task: &Task,
        report: &CompletionReport,
    ) -> ServiceResult<()> {
        let reason = if report.error.is_empty() {
            "rate limited".to_owned()
        } else {
            report.error.clone()
        };

        match decide_rate_limit_retry(task, &reason) {
            RetryDecision::Fail { reason } => {
                self.fail_with_reason(&task.id, &[TaskStatus::Running], &reason)
                    .await?;
            }
            RetryDecision::Retry { streak } => {
                self.store.set_consecutive_failures(&task.id, streak).await?;
                if self
                    .store
                    .schedule_retry_from_running(&task.id, &reason)
                    .await?
                {
                    self.poke_pending();
                } else {
                    debug!(task_id = %task.id, "rate-limit retry lost a race, task no longer running");
                }
            }
        }
        Ok(())
    }

    // -- review outcomes --------------------------------------------------

    /// The reconciler saw the PR merge.
    pub async fn mark_merged(&self, id: &str) -> ServiceResult<()> {
        let applied = self
            .store
            .transition(id, &[TaskStatus::Review], TaskStatus::Merged)
            .await?;
        if applied {
            self.publish_updated(id).await?;
        }
        Ok(())
    }

    /// Retry a review-state task because its PR has failing CI or an
    /// unmergeable conflict. `category` drives the circuit breaker; the
    /// `merge_conflict` category is exempt from all budgets.
    pub async fn retry_review(
        &self,
        id: &str,
        category: &str,
        reason: &str,
        context: &str,
    ) -> ServiceResult<()> {
        let task = self.store.get(id).await?;
        if task.status != TaskStatus::Review {
            return Err(ServiceError::Conflict(format!(
                "task {id} is not in review"
            )));
        }

        let combined = format!("{category}: {reason}");
        if category == MERGE_CONFLICT_CATEGORY {
            if self.store.feedback_retry(id, &combined).await? {
                self.store
                    .set_retry_context(id, tail(context, RETRY_CONTEXT_MAX_BYTES))
                    .await?;
                self.poke_pending();
            }
            self.publish_updated(id).await?;
            return Ok(());
        }

        match decide_review_retry(&task, category) {
            RetryDecision::Fail { reason } => {
                self.fail_with_reason(id, &[TaskStatus::Review], &reason)
                    .await?;
            }
            RetryDecision::Retry { streak } => {
                self.store.set_consecutive_failures(id, streak).await?;
                if self.store.retry_from_review(id, &combined).await? {
                    self.store
                        .set_retry_context(id, tail(context, RETRY_CONTEXT_MAX_BYTES))
                        .await?;
                    self.poke_pending();
                }
            }
        }
        self.publish_updated(id).await?;
        Ok(())
    }

    /// User-requested changes on a review-state task. `max_attempts` is not
    /// enforced here: feedback drives user-paced iteration.
    pub async fn feedback(&self, id: &str, feedback: &str) -> ServiceResult<Task> {
        let task = self.store.get(id).await?;
        if task.status != TaskStatus::Review {
            return Err(ServiceError::Conflict(format!(
                "task {id} is not in review"
            )));
        }
        if task.max_cost_usd > 0.0 && task.cost_usd >= task.max_cost_usd {
            let reason = format!(
                "Budget exceeded: ${:.2} spent of ${:.2} limit",
                task.cost_usd, task.max_cost_usd
            );
            self.fail_with_reason(id, &[TaskStatus::Review], &reason)
                .await?;
            return self.publish_updated(id).await;
        }

        if !self.store.feedback_retry(id, feedback).await? {
            return Err(ServiceError::Conflict(format!(
                "task {id} is not in review"
            )));
        }
        self.poke_pending();
        self.publish_updated(id).await
    }

    // -- operator controls ------------------------------------------------

    /// Close a task from any non-terminal state.
    pub async fn close_task(&self, id: &str, reason: &str) -> ServiceResult<Task> {
        use TaskStatus::*;
        let applied = self
            .store
            .transition(id, &[Pending, Running, Review, Failed], Closed)
            .await?;
        if !applied {
            let task = self.store.get(id).await?;
            return Err(ServiceError::Conflict(format!(
                "task {id} is already {}",
                task.status
            )));
        }
        if !reason.is_empty() {
            self.store.set_close_reason(id, reason).await?;
        }
        self.publish_updated(id).await
    }

    /// Interrupt a running task: back to `pending` with `ready = false`.
    pub async fn stop_task(&self, id: &str, reason: &str) -> ServiceResult<Task> {
        let reason = if reason.is_empty() {
            "Stopped by user"
        } else {
            reason
        };
        if !self.store.stop(id, reason).await? {
            // Distinguish a missing row from a status mismatch.
            let task = self.store.get(id).await?;
            return Err(ServiceError::Conflict(format!(
                "task {id} is {}, not running",
                task.status
            )));
        }
        self.publish_updated(id).await
    }

    /// Operator retry of a failed task. Ignores the circuit breaker;
    /// preserves pr/branch so the next attempt continues the same PR.
    pub async fn manual_retry(&self, id: &str, instructions: &str) -> ServiceResult<Task> {
        if !self.store.manual_retry(id, instructions).await? {
            let task = self.store.get(id).await?;
            return Err(ServiceError::Conflict(format!(
                "task {id} is {}, not failed",
                task.status
            )));
        }
        self.poke_pending();
        self.publish_updated(id).await
    }

    /// Reset a task to a fresh pending, wiping attempts, cost, logs, and
    /// PR state. Returns the pre-reset snapshot so the caller can close an
    /// abandoned PR externally.
    pub async fn start_over(&self, id: &str, params: StartOver) -> ServiceResult<Task> {
        let before = self.store.get(id).await?;
        if !self.store.start_over(id, &params).await? {
            return Err(ServiceError::NotFound);
        }
        self.store.delete_logs(id).await?;
        self.poke_pending();
        self.publish_updated(id).await?;
        Ok(before)
    }

    // -- stall detection --------------------------------------------------

    /// Fail running tasks whose heartbeat is older than `older_than`.
    /// Returns how many tasks were failed.
    pub async fn sweep_stale(&self, older_than: Duration) -> ServiceResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| ServiceError::Invalid(e.to_string()))?;
        let stale = self.store.list_stale(cutoff).await?;

        let mut swept = 0;
        for task in stale {
            let reason = format!(
                "Worker timeout: no heartbeat for {}s",
                older_than.as_secs()
            );
            match self
                .fail_with_reason(&task.id, &[TaskStatus::Running], &reason)
                .await
            {
                Ok(true) => {
                    swept += 1;
                    if let Err(e) = self.publish_updated(&task.id).await {
                        warn!(task_id = %task.id, error = %e, "failed to publish stall event");
                    }
                }
                Ok(false) => {} // no longer running; someone beat us to it
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "failed to sweep stale task");
                }
            }
        }
        Ok(swept)
    }
}
