//! GitHub implementation of [`CodeHost`] over the REST v3 API.

use async_trait::async_trait;
use anyhow::{Context, Result};
use reqwest::header;
use serde::Deserialize;

use super::{CheckConclusion, CheckResult, CodeHost};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("verve/", env!("CARGO_PKG_VERSION"));

/// GitHub REST client with a single token.
pub struct GithubCodeHost {
    client: reqwest::Client,
    api_base: String,
}

impl GithubCodeHost {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    /// Point at a non-default API base (GitHub Enterprise, test servers).
    pub fn with_api_base(token: &str, api_base: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid characters in GitHub token")?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .context("failed to build GitHub client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_owned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    mergeable: Option<bool>,
    head: PullHead,
}

#[derive(Debug, Deserialize)]
struct PullHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
    #[serde(default)]
    output: CheckRunOutput,
}

#[derive(Debug, Default, Deserialize)]
struct CheckRunOutput {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl CheckRun {
    fn conclusion(&self) -> CheckConclusion {
        if self.status != "completed" {
            return CheckConclusion::Pending;
        }
        match self.conclusion.as_deref() {
            Some("success") | Some("neutral") | Some("skipped") => CheckConclusion::Passed,
            Some("failure") | Some("timed_out") | Some("cancelled") | Some("action_required") => {
                CheckConclusion::Failed
            }
            _ => CheckConclusion::Pending,
        }
    }
}

impl GithubCodeHost {
    async fn fetch_pull(&self, repo: &str, pr_number: i32) -> Result<PullResponse> {
        let url = format!("{}/repos/{repo}/pulls/{pr_number}", self.api_base);
        let pull = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch PR #{pr_number} for {repo}"))?
            .error_for_status()
            .with_context(|| format!("GitHub rejected PR fetch for {repo}#{pr_number}"))?
            .json::<PullResponse>()
            .await
            .context("failed to decode PR response")?;
        Ok(pull)
    }
}

#[async_trait]
impl CodeHost for GithubCodeHost {
    async fn is_merged(&self, repo: &str, pr_number: i32) -> Result<bool> {
        // 204 when merged, 404 when not.
        let url = format!("{}/repos/{repo}/pulls/{pr_number}/merge", self.api_base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to check merge state of {repo}#{pr_number}"))?;

        match response.status().as_u16() {
            204 => Ok(true),
            404 => Ok(false),
            other => anyhow::bail!("unexpected status {other} checking merge state of {repo}#{pr_number}"),
        }
    }

    async fn checks(&self, repo: &str, pr_number: i32) -> Result<Vec<CheckResult>> {
        let pull = self.fetch_pull(repo, pr_number).await?;
        let url = format!(
            "{}/repos/{repo}/commits/{}/check-runs",
            self.api_base, pull.head.sha
        );
        let runs = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch check runs for {repo}#{pr_number}"))?
            .error_for_status()
            .with_context(|| format!("GitHub rejected check-runs fetch for {repo}#{pr_number}"))?
            .json::<CheckRunsResponse>()
            .await
            .context("failed to decode check runs")?;

        Ok(runs
            .check_runs
            .into_iter()
            .map(|run| {
                let conclusion = run.conclusion();
                let output = run
                    .output
                    .text
                    .or(run.output.summary)
                    .unwrap_or_default();
                CheckResult {
                    name: run.name,
                    conclusion,
                    output,
                }
            })
            .collect())
    }

    async fn is_mergeable(&self, repo: &str, pr_number: i32) -> Result<Option<bool>> {
        let pull = self.fetch_pull(repo, pr_number).await?;
        Ok(pull.mergeable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: "tests".to_owned(),
            status: status.to_owned(),
            conclusion: conclusion.map(str::to_owned),
            output: CheckRunOutput::default(),
        }
    }

    #[test]
    fn incomplete_run_is_pending() {
        assert_eq!(run("in_progress", None).conclusion(), CheckConclusion::Pending);
        assert_eq!(run("queued", None).conclusion(), CheckConclusion::Pending);
    }

    #[test]
    fn completed_conclusions_map() {
        assert_eq!(
            run("completed", Some("success")).conclusion(),
            CheckConclusion::Passed
        );
        assert_eq!(
            run("completed", Some("skipped")).conclusion(),
            CheckConclusion::Passed
        );
        assert_eq!(
            run("completed", Some("failure")).conclusion(),
            CheckConclusion::Failed
        );
        assert_eq!(
            run("completed", Some("timed_out")).conclusion(),
            CheckConclusion::Failed
        );
    }
}
