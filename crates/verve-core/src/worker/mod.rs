//! The worker process: long-polls the server for tasks, runs the agent in
//! an ephemeral container, streams its output back, and reports the
//! outcome.
//!
//! Workers share no memory with the server; everything goes through the
//! HTTP API, and task exclusivity is the claim CAS on the server side.

pub mod client;
pub mod container;
pub mod logbuf;
pub mod markers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use client::{ApiClient, ClaimedWork, CompletionRequest};
use container::ContainerExit;
use markers::Marker;

/// Worker heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the dispatch server.
    pub server_url: String,
    /// Agent container image; must be present locally.
    pub image: String,
    /// Max tasks run in parallel by this worker.
    pub max_concurrent: usize,
    /// Restrict polling to these repo ids; empty means all.
    pub repos: Vec<String>,
    /// Extra flags appended to `docker run`.
    pub extra_docker_flags: Vec<String>,
    /// Tell the agent not to push anything.
    pub dry_run: bool,
    /// Model credential passed into the container, one of the two.
    pub anthropic_api_key: Option<String>,
    pub claude_oauth_token: Option<String>,
}

impl WorkerConfig {
    pub fn new(server_url: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            image: image.into(),
            max_concurrent: 1,
            repos: Vec::new(),
            extra_docker_flags: Vec::new(),
            dry_run: false,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            claude_oauth_token: std::env::var("CLAUDE_CODE_OAUTH_TOKEN").ok(),
        }
    }
}

/// Run the worker loop until cancelled.
pub async fn run_worker(config: WorkerConfig, cancel: CancellationToken) -> Result<()> {
    container::ensure_image(&config.image).await?;

    let client = ApiClient::new(&config.server_url)?;
    let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let config = Arc::new(config);

    info!(
        server = %config.server_url,
        image = %config.image,
        max_concurrent = config.max_concurrent,
        "worker started"
    );

    loop {
        // Hold a slot before polling so a claimed task always has capacity.
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => permit.context("worker semaphore closed")?,
            _ = cancel.cancelled() => break,
        };

        let poll = tokio::select! {
            poll = client.poll(&config.repos) => poll,
            _ = cancel.cancelled() => break,
        };

        match poll {
            Ok(Some(work)) => {
                let client = client.clone();
                let config = Arc::clone(&config);
                let task_cancel = cancel.child_token();
                tokio::spawn(async move {
                    let task_id = work.task.id.clone();
                    if let Err(e) = run_task(&client, &config, work, task_cancel).await {
                        error!(task_id = %task_id, error = %e, "task attempt failed unexpectedly");
                    }
                    drop(permit);
                });
            }
            Ok(None) => {
                // Empty long-poll: re-poll with a short jittered pause.
                drop(permit);
                let pause = Duration::from_millis(rand::rng().random_range(50..250));
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                drop(permit);
                warn!(error = %e, "poll failed, backing off");
                let backoff = Duration::from_millis(rand::rng().random_range(1_000..3_000));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    info!("worker shutting down");
    Ok(())
}

/// Results captured from the agent's marker lines during one attempt.
#[derive(Debug, Default)]
struct Captured {
    pr_url: String,
    pr_number: i32,
    branch_name: String,
    agent_status: Option<serde_json::Value>,
    no_changes: bool,
    prereq_failed: String,
    cost_usd: f64,
    retryable: bool,
}

impl Captured {
    fn absorb(&mut self, marker: Marker) {
        match marker {
            Marker::PrCreated { url, number } | Marker::PrUpdated { url, number } => {
                self.pr_url = url;
                self.pr_number = number;
            }
            Marker::BranchPushed { branch } => self.branch_name = branch,
            Marker::Status(value) => self.agent_status = Some(value),
            Marker::NoChanges => self.no_changes = true,
            Marker::PrereqFailed(payload) => self.prereq_failed = payload,
            Marker::Cost(cost) => self.cost_usd = cost,
        }
    }
}

/// Run one claimed task: container, log streaming, heartbeats, report.
async fn run_task(
    client: &ApiClient,
    config: &WorkerConfig,
    work: ClaimedWork,
    cancel: CancellationToken,
) -> Result<()> {
    let task = &work.task;
    let name = container::container_name(&task.id, task.attempt);
    info!(task_id = %task.id, attempt = task.attempt, container = %name, "starting agent");

    let env = build_agent_env(config, &work);

    // Raw container output -> marker parsing -> log batcher.
    let (raw_tx, mut raw_rx) = mpsc::channel::<String>(256);
    let (log_tx, log_rx) = mpsc::channel::<String>(256);

    let pump = {
        let client = client.clone();
        let task_id = task.id.clone();
        let attempt = task.attempt;
        tokio::spawn(async move { logbuf::pump_logs(&client, &task_id, attempt, log_rx).await })
    };

    // Heartbeat until cancelled; a `running=false` answer cancels the run.
    let heartbeat = {
        let client = client.clone();
        let task_id = task.id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match client.heartbeat(&task_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                info!(task_id = %task_id, "task no longer running, cancelling attempt");
                                cancel.cancel();
                                return;
                            }
                            Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    };

    let mut captured = Captured::default();

    let container_run = container::run_agent_container(
        &config.image,
        &name,
        &env,
        &config.extra_docker_flags,
        raw_tx,
        &cancel,
    );
    tokio::pin!(container_run);

    // Parse each output line for markers while the container runs, then
    // forward it as log text.
    let exit = loop {
        tokio::select! {
            line = raw_rx.recv() => {
                match line {
                    Some(line) => {
                        if let Some(marker) = markers::parse_marker(&line) {
                            captured.absorb(marker);
                        } else if markers::is_rate_limit_line(&line) {
                            captured.retryable = true;
                        }
                        let _ = log_tx.send(line).await;
                    }
                    None => {
                        // Output closed; the container result follows.
                        break container_run.await;
                    }
                }
            }
            exit = &mut container_run => {
                // Container done; drain remaining buffered lines.
                while let Some(line) = raw_rx.recv().await {
                    if let Some(marker) = markers::parse_marker(&line) {
                        captured.absorb(marker);
                    } else if markers::is_rate_limit_line(&line) {
                        captured.retryable = true;
                    }
                    let _ = log_tx.send(line).await;
                }
                break exit;
            }
        }
    };

    heartbeat.abort();
    drop(log_tx);
    let _ = pump.await; // final flush

    let report_result = match exit {
        Ok(ContainerExit::Cancelled) => {
            // Stopped/deleted server-side: nothing to report.
            info!(task_id = %task.id, "attempt cancelled");
            Ok(())
        }
        Ok(ContainerExit::Exited(code)) => {
            let report = build_report(&captured, code);
            client.complete(&task.id, &report).await
        }
        Err(e) => {
            let report = CompletionRequest {
                success: false,
                error: format!("container run failed: {e:#}"),
                ..Default::default()
            };
            client.complete(&task.id, &report).await
        }
    };

    // Cleanup happens regardless of cancellation or report errors.
    if let Err(e) = container::remove_container(&name).await {
        warn!(container = %name, error = %e, "failed to remove container");
    }

    report_result
}

fn build_report(captured: &Captured, exit_code: i32) -> CompletionRequest {
    let success = exit_code == 0;
    CompletionRequest {
        success,
        error: if success {
            String::new()
        } else {
            format!("agent exited with status {exit_code}")
        },
        pr_url: captured.pr_url.clone(),
        pr_number: captured.pr_number,
        branch_name: captured.branch_name.clone(),
        agent_status: captured.agent_status.clone(),
        cost_usd: captured.cost_usd,
        prereq_failed: captured.prereq_failed.clone(),
        no_changes: captured.no_changes,
        retryable: captured.retryable && !success,
    }
}

/// Environment passed to the agent container. Variable names are the
/// contract with the agent image.
fn build_agent_env(config: &WorkerConfig, work: &ClaimedWork) -> Vec<(String, String)> {
    let task = &work.task;
    let mut env: Vec<(String, String)> = vec![
        ("WORK_TYPE".into(), "task".into()),
        ("TASK_ID".into(), task.id.clone()),
        ("TASK_TITLE".into(), task.title.clone()),
        ("TASK_DESCRIPTION".into(), task.description.clone()),
        ("GITHUB_TOKEN".into(), work.github_token.clone()),
        ("GITHUB_REPO".into(), work.repo_full_name.clone()),
        ("ATTEMPT".into(), task.attempt.to_string()),
    ];

    if !task.model.is_empty() {
        env.push(("CLAUDE_MODEL".into(), task.model.clone()));
    }
    if let Some(key) = &config.anthropic_api_key {
        env.push(("ANTHROPIC_API_KEY".into(), key.clone()));
    } else if let Some(token) = &config.claude_oauth_token {
        env.push(("CLAUDE_CODE_OAUTH_TOKEN".into(), token.clone()));
    }
    // Presence indicates true for these two.
    if config.dry_run {
        env.push(("DRY_RUN".into(), "1".into()));
    }
    if task.skip_pr {
        env.push(("SKIP_PR".into(), "1".into()));
    }

    if task.attempt > 1 {
        env.push(("RETRY_REASON".into(), task.retry_reason.clone()));
        env.push(("RETRY_CONTEXT".into(), task.retry_context.clone()));
        if let Some(status) = &task.agent_status {
            env.push(("PREVIOUS_STATUS".into(), status.to_string()));
        }
    }

    if !task.acceptance_criteria.is_empty() {
        env.push((
            "ACCEPTANCE_CRITERIA".into(),
            format_acceptance_criteria(&task.acceptance_criteria),
        ));
    }

    env
}

/// Criteria are numbered, one per line.
fn format_acceptance_criteria(criteria: &[String]) -> String {
    criteria
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {c}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verve_db::models::{Task, TaskStatus};

    fn claimed(task: Task) -> ClaimedWork {
        ClaimedWork {
            task,
            github_token: "ghp_x".into(),
            repo_full_name: "acme/widgets".into(),
        }
    }

    fn base_task() -> Task {
        let now = Utc::now();
        Task {
            id: "tsk-1".into(),
            repo_id: "acme/widgets".into(),
            epic_id: None,
            title: "add foo".into(),
            description: "do the thing".into(),
            acceptance_criteria: vec!["builds".into(), "tests pass".into()],
            depends_on: vec![],
            status: TaskStatus::Running,
            ready: true,
            attempt: 1,
            max_attempts: 5,
            retry_reason: String::new(),
            retry_context: String::new(),
            consecutive_failures: 0,
            cost_usd: 0.0,
            max_cost_usd: 0.0,
            skip_pr: false,
            model: "claude-sonnet-4-5".into(),
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

    fn config() -> WorkerConfig {
        WorkerConfig {
            server_url: "http://localhost:8080".into(),
            image: "verve-agent:latest".into(),
            max_concurrent: 1,
            repos: vec![],
            extra_docker_flags: vec![],
            dry_run: false,
            anthropic_api_key: Some("sk-test".into()),
            claude_oauth_token: None,
        }
    }

    fn env_get<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn first_attempt_env_omits_retry_vars() {
        let env = build_agent_env(&config(), &claimed(base_task()));
        assert_eq!(env_get(&env, "WORK_TYPE"), Some("task"));
        assert_eq!(env_get(&env, "TASK_ID"), Some("tsk-1"));
        assert_eq!(env_get(&env, "GITHUB_REPO"), Some("acme/widgets"));
        assert_eq!(env_get(&env, "ATTEMPT"), Some("1"));
        assert_eq!(env_get(&env, "ANTHROPIC_API_KEY"), Some("sk-test"));
        assert!(env_get(&env, "RETRY_REASON").is_none());
        assert!(env_get(&env, "SKIP_PR").is_none());
        assert!(env_get(&env, "DRY_RUN").is_none());
    }

    #[test]
    fn retry_attempt_env_carries_guidance() {
        let mut task = base_task();
        task.attempt = 3;
        task.retry_reason = "ci_failure:tests: check tests failed".into();
        task.retry_context = "FAIL foo_test".into();
        task.agent_status = Some(serde_json::json!({"phase": "done"}));
        let env = build_agent_env(&config(), &claimed(task));
        assert_eq!(env_get(&env, "ATTEMPT"), Some("3"));
        assert_eq!(
            env_get(&env, "RETRY_REASON"),
            Some("ci_failure:tests: check tests failed")
        );
        assert_eq!(env_get(&env, "RETRY_CONTEXT"), Some("FAIL foo_test"));
        assert_eq!(
            env_get(&env, "PREVIOUS_STATUS"),
            Some(r#"{"phase":"done"}"#)
        );
    }

    #[test]
    fn skip_pr_and_dry_run_are_presence_flags() {
        let mut cfg = config();
        cfg.dry_run = true;
        let mut task = base_task();
        task.skip_pr = true;
        let env = build_agent_env(&cfg, &claimed(task));
        assert!(env_get(&env, "DRY_RUN").is_some());
        assert!(env_get(&env, "SKIP_PR").is_some());
    }

    #[test]
    fn acceptance_criteria_are_numbered() {
        let env = build_agent_env(&config(), &claimed(base_task()));
        assert_eq!(
            env_get(&env, "ACCEPTANCE_CRITERIA"),
            Some("1. builds\n2. tests pass")
        );
    }

    #[test]
    fn failed_exit_builds_retryable_report_only_on_failure() {
        let mut captured = Captured::default();
        captured.retryable = true;
        let failed = build_report(&captured, 1);
        assert!(!failed.success);
        assert!(failed.retryable);

        let ok = build_report(&captured, 0);
        assert!(ok.success);
        assert!(!ok.retryable, "rate-limit lines on a successful run are noise");
    }

    #[test]
    fn report_carries_markers() {
        let mut captured = Captured::default();
        captured.absorb(Marker::PrCreated {
            url: "https://x/pull/9".into(),
            number: 9,
        });
        captured.absorb(Marker::Cost(0.42));
        captured.absorb(Marker::NoChanges);
        let report = build_report(&captured, 0);
        assert_eq!(report.pr_url, "https://x/pull/9");
        assert_eq!(report.pr_number, 9);
        assert_eq!(report.cost_usd, 0.42);
        assert!(report.no_changes);
    }
}
