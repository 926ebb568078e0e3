//! Lifecycle service tests over the in-memory store.
//!
//! These exercise the full dispatch flow end to end: create, claim,
//! report, retry policy, feedback, stop/start-over, and stall sweeping.
//! The in-memory backend has the same CAS semantics as Postgres, so the
//! concurrency properties checked here hold for both.

use std::sync::Arc;
use std::time::Duration;

use verve_core::event::{EventBroker, EventType};
use verve_core::service::{CompletionReport, NewTask, ServiceError, TaskService};
use verve_db::mem::MemTaskStore;
use verve_db::models::TaskStatus;
use verve_db::store::{StartOver, TaskStore, TaskUpdate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const REPO: &str = "acme/widgets";

fn make_service() -> (Arc<TaskService>, Arc<EventBroker>) {
    let store: Arc<dyn TaskStore> = Arc::new(MemTaskStore::new());
    let broker = Arc::new(EventBroker::new());
    let service = Arc::new(TaskService::new(store, Arc::clone(&broker)));
    (service, broker)
}

fn new_task(title: &str) -> NewTask {
    NewTask {
        title: title.to_owned(),
        description: format!("{title} description"),
        ..Default::default()
    }
}

fn pr_report(url: &str, number: i32, cost: f64) -> CompletionReport {
    CompletionReport {
        success: true,
        pr_url: url.to_owned(),
        pr_number: number,
        cost_usd: cost,
        ..Default::default()
    }
}

/// Create a task and drive it into `review` with a PR.
async fn task_in_review(service: &TaskService) -> String {
    let task = service.create_task(REPO, new_task("to review")).await.unwrap();
    let claimed = service.try_claim(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    service
        .report_completion(&task.id, &pr_report("https://x/pull/1", 1, 0.0))
        .await
        .unwrap();
    task.id
}

// ---------------------------------------------------------------------------
// S1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_happy_path_to_merged() {
    let (service, _broker) = make_service();

    let task = service.create_task(REPO, new_task("add foo")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 1);
    assert_eq!(task.max_attempts, 5);

    let claimed = service.try_claim(None).await.unwrap().expect("should claim");
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert!(claimed.started_at.is_some(), "claim sets started_at");
    assert!(claimed.last_heartbeat_at.is_some());

    service
        .append_logs(&task.id, 1, &["starting".to_owned(), "done".to_owned()])
        .await
        .unwrap();

    let after = service
        .report_completion(&task.id, &pr_report("https://x/pull/1", 1, 0.10))
        .await
        .unwrap();
    assert_eq!(after.status, TaskStatus::Review);
    assert_eq!(after.pr_number, 1);
    assert_eq!(after.pr_url, "https://x/pull/1");
    assert!((after.cost_usd - 0.10).abs() < 1e-9);

    service.mark_merged(&task.id).await.unwrap();
    let done = service.get_task(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Merged);

    let logs = service.list_logs(&task.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].lines, vec!["starting", "done"]);
}

// ---------------------------------------------------------------------------
// S2: dependency gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_dependency_gates_claim() {
    let (service, _broker) = make_service();

    let a = service.create_task(REPO, new_task("a")).await.unwrap();
    let b = service
        .create_task(
            REPO,
            NewTask {
                title: "b".into(),
                depends_on: vec![a.id.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // First poll returns A; B is blocked behind it.
    let first = service.try_claim(None).await.unwrap().expect("A claimable");
    assert_eq!(first.id, a.id);
    assert!(service.try_claim(None).await.unwrap().is_none(), "B blocked");

    // Complete A with no changes -> closed, which satisfies the dependency.
    service
        .report_completion(
            &a.id,
            &CompletionReport {
                success: true,
                no_changes: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let a_done = service.get_task(&a.id).await.unwrap();
    assert_eq!(a_done.status, TaskStatus::Closed);
    assert_eq!(a_done.close_reason, "No changes needed");

    let second = service.try_claim(None).await.unwrap().expect("B unblocked");
    assert_eq!(second.id, b.id);
}

#[tokio::test]
async fn not_ready_tasks_are_never_claimed() {
    let (service, _broker) = make_service();

    let task = service
        .create_task(
            REPO,
            NewTask {
                title: "gated".into(),
                ready: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(service.try_claim(None).await.unwrap().is_none());

    service.set_ready(&task.id, true).await.unwrap();
    let claimed = service.try_claim(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
}

#[tokio::test]
async fn claim_respects_repo_filter() {
    let (service, _broker) = make_service();

    service.create_task("acme/one", new_task("first")).await.unwrap();
    let two = service.create_task("acme/two", new_task("second")).await.unwrap();

    let repos = vec!["acme/two".to_owned()];
    let claimed = service.try_claim(Some(&repos)).await.unwrap().unwrap();
    assert_eq!(claimed.id, two.id);
    assert!(service.try_claim(Some(&repos)).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Property 1: no double-claim
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_pollers_never_double_claim() {
    let (service, _broker) = make_service();

    let task_count = 3;
    for i in 0..task_count {
        service.create_task(REPO, new_task(&format!("t{i}"))).await.unwrap();
    }

    let poller_count = 8;
    let mut handles = Vec::new();
    for _ in 0..poller_count {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service.claim(None, Duration::from_millis(200)).await.unwrap()
        }));
    }

    let mut claimed_ids = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            claimed_ids.push(task.id);
        }
    }

    assert_eq!(claimed_ids.len(), task_count, "every task claimed once");
    let mut deduped = claimed_ids.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), task_count, "no duplicates");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_poll_wakes_on_create() {
    let (service, _broker) = make_service();

    let poller = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.claim(None, Duration::from_secs(5)).await.unwrap() })
    };

    // Let the poller park on the pending signal first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = service.create_task(REPO, new_task("wakes")).await.unwrap();

    let claimed = tokio::time::timeout(Duration::from_secs(2), poller)
        .await
        .expect("poller should wake well before its deadline")
        .unwrap()
        .expect("should claim the new task");
    assert_eq!(claimed.id, task.id);
}

#[tokio::test]
async fn long_poll_returns_none_on_deadline() {
    let (service, _broker) = make_service();
    let got = service.claim(None, Duration::from_millis(50)).await.unwrap();
    assert!(got.is_none());
}

// ---------------------------------------------------------------------------
// S3 / property 7: CI retry and circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_ci_failure_retry_then_breaker_trips() {
    let (service, _broker) = make_service();
    let id = task_in_review(&service).await;

    service
        .retry_review(&id, "ci_failure:tests", "check tests failed", "FAIL\nassertion")
        .await
        .unwrap();

    let task = service.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 2);
    assert!(task.retry_reason.starts_with("ci_failure:tests:"));
    assert_eq!(task.consecutive_failures, 1);
    assert_eq!(task.retry_context, "FAIL\nassertion");
    assert_eq!(task.pr_number, 1, "PR survives the retry");

    // Re-run and land back in review.
    service.try_claim(None).await.unwrap().expect("re-claim");
    service
        .report_completion(&id, &CompletionReport { success: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(service.get_task(&id).await.unwrap().status, TaskStatus::Review);

    // Same category again: breaker trips.
    service
        .retry_review(&id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();
    let task = service.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.close_reason.contains("Circuit breaker"));
}

#[tokio::test]
async fn different_category_defeats_breaker() {
    let (service, _broker) = make_service();
    let id = task_in_review(&service).await;

    service
        .retry_review(&id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service
        .report_completion(&id, &CompletionReport { success: true, ..Default::default() })
        .await
        .unwrap();

    service
        .retry_review(&id, "ci_failure:lint", "check lint failed", "")
        .await
        .unwrap();

    let task = service.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "category change resets the streak");
    assert_eq!(task.attempt, 3);
    assert_eq!(task.consecutive_failures, 1);
}

// ---------------------------------------------------------------------------
// S4 / property 6: merge-conflict exemption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_merge_conflict_is_exempt_from_attempt_cap() {
    let (service, _broker) = make_service();

    let task = service
        .create_task(
            REPO,
            NewTask {
                title: "conflicted".into(),
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service
        .report_completion(&task.id, &pr_report("https://x/pull/4", 4, 0.0))
        .await
        .unwrap();

    // attempt == max_attempts, but a conflict retry still goes through and
    // preserves the remaining budget.
    service
        .retry_review(&task.id, "merge_conflict", "rebase required", "")
        .await
        .unwrap();

    let after = service.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.attempt, 2);
    assert_eq!(after.max_attempts, 2);
    assert_eq!(after.pr_number, 4);
    assert!(after.retry_reason.starts_with("merge_conflict:"));
}

// ---------------------------------------------------------------------------
// Properties 5 and 6: budgets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_exceeded_fails_instead_of_retrying() {
    let (service, _broker) = make_service();

    let task = service
        .create_task(
            REPO,
            NewTask {
                title: "expensive".into(),
                max_cost_usd: Some(0.05),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service
        .report_completion(&task.id, &pr_report("https://x/pull/2", 2, 0.10))
        .await
        .unwrap();

    service
        .retry_review(&task.id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();

    let after = service.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(after.close_reason.contains("Budget exceeded"));
}

#[tokio::test]
async fn attempt_cap_fails_instead_of_retrying() {
    let (service, _broker) = make_service();

    let task = service
        .create_task(
            REPO,
            NewTask {
                title: "capped".into(),
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service
        .report_completion(&task.id, &pr_report("https://x/pull/3", 3, 0.0))
        .await
        .unwrap();

    service
        .retry_review(&task.id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();

    let after = service.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(after.close_reason.contains("exhausted"));
}

// ---------------------------------------------------------------------------
// Property 8: feedback and manual retry preserve PR state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feedback_preserves_pr_and_extends_budget() {
    let (service, _broker) = make_service();
    let id = task_in_review(&service).await;

    let updated = service.feedback(&id, "also handle the bar case").await.unwrap();
    assert_eq!(updated.status, TaskStatus::Pending);
    assert_eq!(updated.attempt, 2);
    assert_eq!(updated.max_attempts, 6, "feedback grows the cap with the attempt");
    assert_eq!(updated.retry_reason, "also handle the bar case");
    assert_eq!(updated.pr_number, 1);
    assert_eq!(updated.pr_url, "https://x/pull/1");
    assert_eq!(updated.consecutive_failures, 0);
}

#[tokio::test]
async fn feedback_outside_review_conflicts() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("fresh")).await.unwrap();
    let err = service.feedback(&task.id, "nope").await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn manual_retry_preserves_pr_and_resets_breaker() {
    let (service, _broker) = make_service();
    let id = task_in_review(&service).await;

    // Drive to failed by tripping the breaker; the PR fields stay set.
    service
        .retry_review(&id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service
        .report_completion(&id, &CompletionReport { success: true, ..Default::default() })
        .await
        .unwrap();
    service
        .retry_review(&id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();
    let failed = service.get_task(&id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.pr_number, 1);

    let retried = service.manual_retry(&id, "please try again").await.unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.consecutive_failures, 0);
    assert!(retried.close_reason.is_empty());
    assert_eq!(retried.retry_reason, "please try again");
    assert_eq!(retried.pr_number, 1, "PR survives manual retry");
    assert_eq!(retried.pr_url, "https://x/pull/1");
}

#[tokio::test]
async fn manual_retry_requires_failed() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("still pending")).await.unwrap();
    let err = service.manual_retry(&task.id, "").await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Rate-limit in-run retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_retries_then_fails_after_three() {
    let (service, _broker) = make_service();

    let task = service
        .create_task(
            REPO,
            NewTask {
                title: "throttled".into(),
                max_attempts: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let rate_limited = CompletionReport {
        success: false,
        retryable: true,
        error: "rate limit reached".into(),
        ..Default::default()
    };

    for expected_streak in 1..=3 {
        service.try_claim(None).await.unwrap().expect("claimable");
        service.report_completion(&task.id, &rate_limited).await.unwrap();
        let t = service.get_task(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.consecutive_failures, expected_streak);
        assert_eq!(t.pr_number, 0);
    }

    // Fourth consecutive same-reason failure gives up.
    service.try_claim(None).await.unwrap().unwrap();
    service.report_completion(&task.id, &rate_limited).await.unwrap();
    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.close_reason.contains("Repeated retryable errors"));
}

// ---------------------------------------------------------------------------
// Completion dispatch table
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prereq_failure_closes_with_payload() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("prereq")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    service
        .report_completion(
            &task.id,
            &CompletionReport {
                success: false,
                prereq_failed: r#"{"missing":["ANTHROPIC_API_KEY"]}"#.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.close_reason, r#"{"missing":["ANTHROPIC_API_KEY"]}"#);
}

#[tokio::test]
async fn failure_with_prior_pr_returns_to_review() {
    let (service, _broker) = make_service();
    let id = task_in_review(&service).await;
    service
        .retry_review(&id, "ci_failure:tests", "check tests failed", "")
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    // The retained open PR still needs attention even though the attempt
    // failed.
    service
        .report_completion(
            &id,
            &CompletionReport {
                success: false,
                error: "agent exited with status 1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(service.get_task(&id).await.unwrap().status, TaskStatus::Review);
}

#[tokio::test]
async fn plain_failure_records_error_as_close_reason() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("boom")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    service
        .report_completion(
            &task.id,
            &CompletionReport {
                success: false,
                error: "agent exited with status 2".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.close_reason, "agent exited with status 2");
}

#[tokio::test]
async fn branch_only_success_reaches_review() {
    let (service, _broker) = make_service();
    let task = service
        .create_task(
            REPO,
            NewTask {
                title: "skip pr".into(),
                skip_pr: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    service
        .report_completion(
            &task.id,
            &CompletionReport {
                success: true,
                branch_name: "verve/skip-pr".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Review);
    assert_eq!(t.branch_name, "verve/skip-pr");
    assert_eq!(t.pr_number, 0);

    let no_pr = service.store().list_in_review_no_pr().await.unwrap();
    assert_eq!(no_pr.len(), 1);
}

#[tokio::test]
async fn silent_success_closes() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("quiet")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    service
        .report_completion(&task.id, &CompletionReport { success: true, ..Default::default() })
        .await
        .unwrap();
    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Closed);
    assert!(t.close_reason.is_empty());
}

#[tokio::test]
async fn agent_status_and_cost_recorded_before_dispatch() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("status")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    service
        .report_completion(
            &task.id,
            &CompletionReport {
                success: true,
                agent_status: Some(serde_json::json!({"files_changed": 3})),
                cost_usd: 0.07,
                no_changes: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.agent_status.unwrap()["files_changed"], 3);
    assert!((t.cost_usd - 0.07).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// S5: stop and start over
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_stop_then_start_over() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("restartable")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service.append_logs(&task.id, 1, &["partial".to_owned()]).await.unwrap();

    let stopped = service.stop_task(&task.id, "").await.unwrap();
    assert_eq!(stopped.status, TaskStatus::Pending);
    assert!(!stopped.ready, "stopped tasks are not re-claimable");
    assert_eq!(stopped.close_reason, "Stopped by user");
    assert!(service.try_claim(None).await.unwrap().is_none());

    let before = service
        .start_over(
            &task.id,
            StartOver {
                description: Some("fresh description".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(before.close_reason, "Stopped by user", "snapshot is pre-reset");

    let fresh = service.get_task(&task.id).await.unwrap();
    assert_eq!(fresh.status, TaskStatus::Pending);
    assert!(fresh.ready);
    assert_eq!(fresh.attempt, 1);
    assert_eq!(fresh.cost_usd, 0.0);
    assert_eq!(fresh.pr_number, 0);
    assert_eq!(fresh.description, "fresh description");
    assert!(service.list_logs(&task.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn stop_requires_running() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("idle")).await.unwrap();
    let err = service.stop_task(&task.id, "").await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// S6: heartbeat stall detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_stalled_task_is_failed_by_sweeper() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("stalls")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    // Zero threshold: the just-claimed task is already stale.
    let swept = service.sweep_stale(Duration::ZERO).await.unwrap();
    assert_eq!(swept, 1);

    let t = service.get_task(&task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.close_reason.starts_with("Worker timeout"));

    // Heartbeat now reports not-running so the worker cancels.
    assert!(!service.heartbeat(&task.id).await.unwrap());
}

#[tokio::test]
async fn healthy_task_survives_sweep() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("healthy")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    let swept = service.sweep_stale(Duration::from_secs(300)).await.unwrap();
    assert_eq!(swept, 0);
    assert_eq!(service.get_task(&task.id).await.unwrap().status, TaskStatus::Running);
}

// ---------------------------------------------------------------------------
// Authoring: update, delete, dependencies, close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_rejects_cycles_and_unknown_deps() {
    let (service, _broker) = make_service();
    let a = service.create_task(REPO, new_task("a")).await.unwrap();
    let b = service
        .create_task(
            REPO,
            NewTask {
                title: "b".into(),
                depends_on: vec![a.id.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // a -> b would close the ring a <- b.
    let err = service
        .update_task(
            &a.id,
            TaskUpdate {
                depends_on: Some(vec![b.id.clone()]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(ref m) if m.contains("cycle")));

    let err = service
        .update_task(
            &a.id,
            TaskUpdate {
                depends_on: Some(vec!["tsk-nope".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(ref m) if m.contains("unknown dependency")));
}

#[tokio::test]
async fn create_rejects_unknown_dependency() {
    let (service, _broker) = make_service();
    let err = service
        .create_task(
            REPO,
            NewTask {
                title: "orphan dep".into(),
                depends_on: vec!["tsk-missing".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
}

#[tokio::test]
async fn update_requires_pending() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("locked")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();

    let err = service
        .update_task(
            &task.id,
            TaskUpdate {
                title: Some("too late".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn delete_unblocks_dependents() {
    let (service, _broker) = make_service();
    let a = service.create_task(REPO, new_task("doomed")).await.unwrap();
    let b = service
        .create_task(
            REPO,
            NewTask {
                title: "survivor".into(),
                depends_on: vec![a.id.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    service.delete_task(&a.id).await.unwrap();
    assert!(matches!(
        service.get_task(&a.id).await.unwrap_err(),
        ServiceError::NotFound
    ));

    let b_now = service.get_task(&b.id).await.unwrap();
    assert!(b_now.depends_on.is_empty(), "back-reference scrubbed");
    let claimed = service.try_claim(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, b.id);
}

#[tokio::test]
async fn close_is_terminal() {
    let (service, _broker) = make_service();
    let task = service.create_task(REPO, new_task("closeable")).await.unwrap();

    let closed = service.close_task(&task.id, "superseded").await.unwrap();
    assert_eq!(closed.status, TaskStatus::Closed);
    assert_eq!(closed.close_reason, "superseded");

    let err = service.close_task(&task.id, "").await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_publishes_events_in_order() {
    let (service, broker) = make_service();
    let (_id, mut rx) = broker.subscribe();

    let task = service.create_task(REPO, new_task("observed")).await.unwrap();
    service.try_claim(None).await.unwrap().unwrap();
    service.append_logs(&task.id, 1, &["line".to_owned()]).await.unwrap();

    let created = rx.recv().await.unwrap();
    assert_eq!(created.event_type, EventType::TaskCreated);
    assert_eq!(created.task.as_ref().unwrap().status, TaskStatus::Pending);

    let claimed = rx.recv().await.unwrap();
    assert_eq!(claimed.event_type, EventType::TaskUpdated);
    assert_eq!(claimed.task.as_ref().unwrap().status, TaskStatus::Running);

    let logs = rx.recv().await.unwrap();
    assert_eq!(logs.event_type, EventType::LogsAppended);
    assert_eq!(logs.attempt, Some(1));
    assert_eq!(logs.logs.as_deref(), Some(&["line".to_owned()][..]));
}

#[tokio::test]
async fn logs_for_deleted_task_are_swallowed() {
    let (service, _broker) = make_service();
    // No task row at all: the append is silently ignored.
    service
        .append_logs("tsk-ghost", 1, &["orphan line".to_owned()])
        .await
        .unwrap();
}
