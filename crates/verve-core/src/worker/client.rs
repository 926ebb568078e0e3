//! HTTP client for the worker's side of the dispatch API.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use verve_db::models::Task;

use crate::service::CLAIM_POLL_TIMEOUT;

/// A claimed task plus the credentials the worker needs to act on it.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimedWork {
    pub task: Task,
    pub github_token: String,
    pub repo_full_name: String,
}

#[derive(Debug, Serialize)]
struct LogsRequest<'a> {
    attempt: i32,
    logs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    running: bool,
}

/// Completion report body; field names match the server's expectations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionRequest {
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pr_url: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub pr_number: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prereq_failed: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_changes: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

fn is_zero_f64(n: &f64) -> bool {
    *n == 0.0
}

/// Client for the `/api/v1` surface used by workers.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            // Long-poll holds the connection up to 30s; leave headroom.
            .timeout(CLAIM_POLL_TIMEOUT + Duration::from_secs(15))
            .build()
            .context("failed to build API client")?;
        Ok(Self {
            http,
            base_url: format!("{}/api/v1", base_url.trim_end_matches('/')),
        })
    }

    /// Long-poll for work. `None` when the server answered 204 (deadline
    /// passed with nothing eligible).
    pub async fn poll(&self, repo_ids: &[String]) -> Result<Option<ClaimedWork>> {
        let mut request = self.http.get(format!("{}/tasks/poll", self.base_url));
        if !repo_ids.is_empty() {
            request = request.query(&[("repos", repo_ids.join(","))]);
        }
        let response = request.send().await.context("poll request failed")?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let work = response
                    .json::<ClaimedWork>()
                    .await
                    .context("failed to decode poll response")?;
                Ok(Some(work))
            }
            status => anyhow::bail!("poll returned unexpected status {status}"),
        }
    }

    /// Ship a batch of log lines for an attempt.
    pub async fn append_logs(&self, task_id: &str, attempt: i32, lines: &[String]) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{task_id}/logs", self.base_url))
            .json(&LogsRequest {
                attempt,
                logs: lines,
            })
            .send()
            .await
            .context("log request failed")?
            .error_for_status()
            .context("server rejected log batch")?;
        Ok(())
    }

    /// Report liveness. `false` tells the worker the task is no longer
    /// running (stopped, deleted, started over) and it must cancel.
    pub async fn heartbeat(&self, task_id: &str) -> Result<bool> {
        let response = self
            .http
            .post(format!("{}/tasks/{task_id}/heartbeat", self.base_url))
            .send()
            .await
            .context("heartbeat request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body = response
            .error_for_status()
            .context("server rejected heartbeat")?
            .json::<HeartbeatResponse>()
            .await
            .context("failed to decode heartbeat response")?;
        Ok(body.running)
    }

    /// Report the outcome of an attempt.
    pub async fn complete(&self, task_id: &str, report: &CompletionRequest) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{task_id}/complete", self.base_url))
            .json(report)
            .send()
            .await
            .context("completion request failed")?
            .error_for_status()
            .context("server rejected completion report")?;
        Ok(())
    }
}
