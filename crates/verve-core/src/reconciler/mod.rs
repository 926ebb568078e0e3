//! PR reconciliation: projects code-host state back into the task state
//! machine.
//!
//! A periodic loop reads review-state tasks with a PR, asks the code host
//! whether the PR merged, broke CI, or hit a conflict, and feeds the
//! outcome to the lifecycle service. Per-task failures are logged and
//! swallowed so one flaky API call never stalls the sweep.

pub mod github;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use verve_db::models::Task;

use crate::creds::HostCredentials;
use crate::service::retry::MERGE_CONFLICT_CATEGORY;
use crate::service::{TaskService, RETRY_CONTEXT_MAX_BYTES};

/// Default reconcile interval.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Conclusion of one required check on a PR head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Passed,
    Failed,
    Pending,
}

/// One check run on the PR head commit.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub conclusion: CheckConclusion,
    /// Tail of the check's output, used as retry context.
    pub output: String,
}

/// Read-only view of a pull request on the code host.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn is_merged(&self, repo: &str, pr_number: i32) -> anyhow::Result<bool>;
    async fn checks(&self, repo: &str, pr_number: i32) -> anyhow::Result<Vec<CheckResult>>;
    /// `None` when the host has not computed mergeability yet.
    async fn is_mergeable(&self, repo: &str, pr_number: i32) -> anyhow::Result<Option<bool>>;
}

/// Run the reconcile loop until cancelled.
pub async fn run_reconciler(
    service: Arc<TaskService>,
    host: Arc<dyn CodeHost>,
    creds: Arc<dyn HostCredentials>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reconciler shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = reconcile_once(&service, host.as_ref(), creds.as_ref()).await {
                    warn!(error = %e, "reconcile sweep failed");
                }
            }
        }
    }
}

/// One sweep over every review-state task with a PR.
pub async fn reconcile_once(
    service: &TaskService,
    host: &dyn CodeHost,
    creds: &dyn HostCredentials,
) -> anyhow::Result<()> {
    let in_review = service.list_in_review().await?;
    for task in in_review.iter().filter(|t| t.pr_number > 0) {
        if let Err(e) = sync_task(service, host, creds, task).await {
            // Swallowed: the next sweep retries.
            warn!(task_id = %task.id, pr = task.pr_number, error = %e, "failed to sync task PR");
        }
    }
    Ok(())
}

/// Reconcile one task against its PR. Also drives `POST /tasks/{id}/sync`.
pub async fn sync_task(
    service: &TaskService,
    host: &dyn CodeHost,
    creds: &dyn HostCredentials,
    task: &Task,
) -> anyhow::Result<()> {
    let repo = creds.for_repo(&task.repo_id).await?.repo_full_name;

    if host.is_merged(&repo, task.pr_number).await? {
        info!(task_id = %task.id, pr = task.pr_number, "PR merged");
        service.mark_merged(&task.id).await?;
        return Ok(());
    }

    let checks = host.checks(&repo, task.pr_number).await?;
    if let Some(failing) = checks
        .iter()
        .find(|c| c.conclusion == CheckConclusion::Failed)
    {
        info!(task_id = %task.id, check = %failing.name, "PR has a failing check");
        let category = format!("ci_failure:{}", failing.name);
        let reason = format!("check {} failed", failing.name);
        let context = truncate_tail(&failing.output, RETRY_CONTEXT_MAX_BYTES);
        service
            .retry_review(&task.id, &category, &reason, context)
            .await?;
        return Ok(());
    }

    if host.is_mergeable(&repo, task.pr_number).await? == Some(false) {
        info!(task_id = %task.id, pr = task.pr_number, "PR has a merge conflict");
        service
            .retry_review(
                &task.id,
                MERGE_CONFLICT_CATEGORY,
                &format!("PR #{} cannot be merged cleanly, rebase required", task.pr_number),
                "",
            )
            .await?;
        return Ok(());
    }

    debug!(task_id = %task.id, pr = task.pr_number, "PR still pending review");
    Ok(())
}

fn truncate_tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
