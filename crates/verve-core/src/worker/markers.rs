//! Structured marker lines emitted by the agent on stdout/stderr.
//!
//! Everything that is not a marker is free-form log text. Markers carry the
//! agent's results out of the container without the worker having to parse
//! the agent's own output format.

use serde::Deserialize;
use tracing::warn;

/// Case-insensitive substrings that mark a line as a rate-limit error.
pub const RATE_LIMIT_PATTERNS: &[&str] = &[
    "max usage",
    "rate limit",
    "rate_limit",
    "too many requests",
    "overloaded_error",
];

/// A parsed marker line.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// `VERVE_PR_CREATED: {"url":...,"number":...}`
    PrCreated { url: String, number: i32 },
    /// `VERVE_PR_UPDATED: {"url":...,"number":...}` (retries)
    PrUpdated { url: String, number: i32 },
    /// `VERVE_BRANCH_PUSHED: {"branch":...}` (skip-pr mode)
    BranchPushed { branch: String },
    /// `VERVE_STATUS: <opaque json>`
    Status(serde_json::Value),
    /// `VERVE_NO_CHANGES:`
    NoChanges,
    /// `VERVE_PREREQ_FAILED: <json>`
    PrereqFailed(String),
    /// `VERVE_COST: <float>`
    Cost(f64),
}

#[derive(Debug, Deserialize)]
struct PrPayload {
    url: String,
    number: i32,
}

#[derive(Debug, Deserialize)]
struct BranchPayload {
    branch: String,
}

/// Parse one output line. Returns `None` for ordinary log text; malformed
/// marker payloads are logged and treated as log text too.
pub fn parse_marker(line: &str) -> Option<Marker> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("VERVE_PR_CREATED:") {
        return parse_pr(rest).map(|(url, number)| Marker::PrCreated { url, number });
    }
    if let Some(rest) = line.strip_prefix("VERVE_PR_UPDATED:") {
        return parse_pr(rest).map(|(url, number)| Marker::PrUpdated { url, number });
    }
    if let Some(rest) = line.strip_prefix("VERVE_BRANCH_PUSHED:") {
        match serde_json::from_str::<BranchPayload>(rest.trim()) {
            Ok(payload) => return Some(Marker::BranchPushed { branch: payload.branch }),
            Err(e) => {
                warn!(error = %e, "malformed VERVE_BRANCH_PUSHED payload");
                return None;
            }
        }
    }
    if let Some(rest) = line.strip_prefix("VERVE_STATUS:") {
        match serde_json::from_str(rest.trim()) {
            Ok(value) => return Some(Marker::Status(value)),
            Err(e) => {
                warn!(error = %e, "malformed VERVE_STATUS payload");
                return None;
            }
        }
    }
    if line.strip_prefix("VERVE_NO_CHANGES:").is_some() {
        return Some(Marker::NoChanges);
    }
    if let Some(rest) = line.strip_prefix("VERVE_PREREQ_FAILED:") {
        return Some(Marker::PrereqFailed(rest.trim().to_owned()));
    }
    if let Some(rest) = line.strip_prefix("VERVE_COST:") {
        match rest.trim().parse::<f64>() {
            Ok(cost) => return Some(Marker::Cost(cost)),
            Err(e) => {
                warn!(error = %e, "malformed VERVE_COST payload");
                return None;
            }
        }
    }
    None
}

fn parse_pr(payload: &str) -> Option<(String, i32)> {
    match serde_json::from_str::<PrPayload>(payload.trim()) {
        Ok(pr) => Some((pr.url, pr.number)),
        Err(e) => {
            warn!(error = %e, "malformed PR marker payload");
            None
        }
    }
}

/// Whether a log line looks like a rate-limit error from the model
/// provider. Case-insensitive substring match.
pub fn is_rate_limit_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_created_parses() {
        let marker = parse_marker(r#"VERVE_PR_CREATED: {"url":"https://x/pull/1","number":1}"#);
        assert_eq!(
            marker,
            Some(Marker::PrCreated {
                url: "https://x/pull/1".to_owned(),
                number: 1,
            })
        );
    }

    #[test]
    fn pr_updated_parses() {
        let marker = parse_marker(r#"VERVE_PR_UPDATED: {"url":"https://x/pull/2","number":2}"#);
        assert_eq!(
            marker,
            Some(Marker::PrUpdated {
                url: "https://x/pull/2".to_owned(),
                number: 2,
            })
        );
    }

    #[test]
    fn branch_pushed_parses() {
        let marker = parse_marker(r#"VERVE_BRANCH_PUSHED: {"branch":"verve/add-foo"}"#);
        assert_eq!(
            marker,
            Some(Marker::BranchPushed {
                branch: "verve/add-foo".to_owned(),
            })
        );
    }

    #[test]
    fn status_is_opaque_json() {
        let marker = parse_marker(r#"VERVE_STATUS: {"phase":"testing","files":3}"#);
        match marker {
            Some(Marker::Status(value)) => assert_eq!(value["phase"], "testing"),
            other => panic!("expected status marker, got {other:?}"),
        }
    }

    #[test]
    fn no_changes_and_cost() {
        assert_eq!(parse_marker("VERVE_NO_CHANGES:"), Some(Marker::NoChanges));
        assert_eq!(parse_marker("VERVE_COST: 0.25"), Some(Marker::Cost(0.25)));
    }

    #[test]
    fn prereq_failed_keeps_raw_json() {
        let marker = parse_marker(r#"VERVE_PREREQ_FAILED: {"missing":["API_KEY"]}"#);
        assert_eq!(
            marker,
            Some(Marker::PrereqFailed(r#"{"missing":["API_KEY"]}"#.to_owned()))
        );
    }

    #[test]
    fn plain_lines_are_not_markers() {
        assert_eq!(parse_marker("compiling crate foo v0.1"), None);
        assert_eq!(parse_marker(""), None);
        assert_eq!(parse_marker("VERVE_UNKNOWN: x"), None);
    }

    #[test]
    fn malformed_payload_degrades_to_log_text() {
        assert_eq!(parse_marker("VERVE_PR_CREATED: not-json"), None);
        assert_eq!(parse_marker("VERVE_COST: lots"), None);
    }

    #[test]
    fn rate_limit_patterns_match_case_insensitively() {
        assert!(is_rate_limit_line("Error: Rate Limit exceeded"));
        assert!(is_rate_limit_line("anthropic api: overloaded_error"));
        assert!(is_rate_limit_line("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_line("you have hit MAX USAGE for today"));
        assert!(!is_rate_limit_line("all tests passed"));
    }
}
