//! Retry categorization and the circuit breaker.
//!
//! The breaker matches `retry_reason` by prefix `"<category>:"`: two
//! consecutive retries in the same category fail the task, while a retry in
//! a different category resets the streak. Merge conflicts are exempt from
//! all of this and handled by the caller.

use verve_db::models::Task;

/// Category exempt from `max_attempts` and the circuit breaker. Conflicting
/// tasks against a hot repo must be able to iterate until rebased cleanly.
pub const MERGE_CONFLICT_CATEGORY: &str = "merge_conflict";

/// Consecutive same-reason rate-limit retries allowed before failing.
pub const RATE_LIMIT_RETRY_MAX: i32 = 3;

/// What to do with a review-state task whose PR came back bad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue; `streak` is the new `consecutive_failures` value.
    Retry { streak: i32 },
    /// Fail immediately with this close reason.
    Fail { reason: String },
}

/// Decide whether a non-merge-conflict review retry may proceed.
///
/// Checks, in order: cost budget, attempt budget, then the circuit breaker.
pub fn decide_review_retry(task: &Task, category: &str) -> RetryDecision {
    if task.max_cost_usd > 0.0 && task.cost_usd >= task.max_cost_usd {
        return RetryDecision::Fail {
            reason: format!(
                "Budget exceeded: ${:.2} spent of ${:.2} limit",
                task.cost_usd, task.max_cost_usd
            ),
        };
    }

    if task.attempt >= task.max_attempts {
        return RetryDecision::Fail {
            reason: format!(
                "Retry attempts exhausted ({} of {})",
                task.attempt, task.max_attempts
            ),
        };
    }

    let streak = category_streak(task, category);
    if streak >= 2 {
        return RetryDecision::Fail {
            reason: format!("Circuit breaker: {category} failed twice in a row"),
        };
    }

    RetryDecision::Retry { streak }
}

/// Decide whether an in-run retryable error (rate limit, session
/// exhaustion) may re-queue the task.
pub fn decide_rate_limit_retry(task: &Task, reason: &str) -> RetryDecision {
    if task.attempt >= task.max_attempts {
        return RetryDecision::Fail {
            reason: format!(
                "Retry attempts exhausted ({} of {})",
                task.attempt, task.max_attempts
            ),
        };
    }

    let streak = if task.retry_reason == reason {
        task.consecutive_failures + 1
    } else {
        1
    };
    if streak > RATE_LIMIT_RETRY_MAX {
        return RetryDecision::Fail {
            reason: format!("Repeated retryable errors ({streak} consecutive): {reason}"),
        };
    }

    RetryDecision::Retry { streak }
}

/// Streak length if this retry proceeds: previous streak plus one when the
/// stored `retry_reason` is in the same category, else a fresh streak.
fn category_streak(task: &Task, category: &str) -> i32 {
    let prefix = format!("{category}:");
    if task.retry_reason.starts_with(&prefix) {
        task.consecutive_failures + 1
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verve_db::models::{new_task_id, TaskStatus};

    fn review_task() -> Task {
        let now = Utc::now();
        Task {
            id: new_task_id(),
            repo_id: "acme/widgets".to_owned(),
            epic_id: None,
            title: "t".to_owned(),
            description: String::new(),
            acceptance_criteria: vec![],
            depends_on: vec![],
            status: TaskStatus::Review,
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

    #[test]
    fn first_failure_in_category_retries() {
        let task = review_task();
        let decision = decide_review_retry(&task, "ci_failure:tests");
        assert_eq!(decision, RetryDecision::Retry { streak: 1 });
    }

    #[test]
    fn second_failure_in_same_category_trips_breaker() {
        let mut task = review_task();
        task.retry_reason = "ci_failure:tests: FAIL output".to_owned();
        task.consecutive_failures = 1;
        task.attempt = 2;
        let decision = decide_review_retry(&task, "ci_failure:tests");
        assert!(matches!(decision, RetryDecision::Fail { ref reason }
            if reason.contains("Circuit breaker")));
    }

    #[test]
    fn different_category_resets_streak() {
        let mut task = review_task();
        task.retry_reason = "ci_failure:tests: FAIL output".to_owned();
        task.consecutive_failures = 1;
        task.attempt = 2;
        let decision = decide_review_retry(&task, "ci_failure:lint");
        assert_eq!(decision, RetryDecision::Retry { streak: 1 });
    }

    #[test]
    fn budget_checked_before_breaker() {
        let mut task = review_task();
        task.cost_usd = 4.0;
        task.max_cost_usd = 3.5;
        let decision = decide_review_retry(&task, "ci_failure:tests");
        assert!(matches!(decision, RetryDecision::Fail { ref reason }
            if reason.contains("Budget exceeded")));
    }

    #[test]
    fn attempt_cap_enforced() {
        let mut task = review_task();
        task.attempt = 5;
        let decision = decide_review_retry(&task, "ci_failure:tests");
        assert!(matches!(decision, RetryDecision::Fail { ref reason }
            if reason.contains("exhausted")));
    }

    #[test]
    fn rate_limit_streak_caps_at_three() {
        let mut task = review_task();
        task.retry_reason = "rate limited".to_owned();

        task.consecutive_failures = 2;
        assert_eq!(
            decide_rate_limit_retry(&task, "rate limited"),
            RetryDecision::Retry { streak: 3 }
        );

        task.consecutive_failures = 3;
        assert!(matches!(
            decide_rate_limit_retry(&task, "rate limited"),
            RetryDecision::Fail { .. }
        ));
    }

    #[test]
    fn rate_limit_different_reason_starts_over() {
        let mut task = review_task();
        task.retry_reason = "rate limited".to_owned();
        task.consecutive_failures = 3;
        assert_eq!(
            decide_rate_limit_retry(&task, "overloaded"),
            RetryDecision::Retry { streak: 1 }
        );
    }
}
