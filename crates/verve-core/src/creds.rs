//! Code-host credentials for workers.
//!
//! Workers stay stateless: the claim response embeds the repo's full name
//! and an access token issued per task by the server. This trait is the
//! seam where a real secret store plugs in.

use async_trait::async_trait;

/// Credentials a worker needs to push to one repository.
#[derive(Debug, Clone)]
pub struct RepoCredentials {
    /// `owner/name` on the code host.
    pub repo_full_name: String,
    /// Access token scoped to the repository.
    pub token: String,
}

#[async_trait]
pub trait HostCredentials: Send + Sync {
    async fn for_repo(&self, repo_id: &str) -> anyhow::Result<RepoCredentials>;
}

/// Single-token provider: `repo_id` doubles as the `owner/name` and one
/// configured token covers every repository.
pub struct StaticTokenCredentials {
    token: String,
}

impl StaticTokenCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl HostCredentials for StaticTokenCredentials {
    async fn for_repo(&self, repo_id: &str) -> anyhow::Result<RepoCredentials> {
        if !repo_id.contains('/') {
            anyhow::bail!("repo id {repo_id:?} is not an owner/name pair");
        }
        Ok(RepoCredentials {
            repo_full_name: repo_id.to_owned(),
            token: self.token.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_pass_repo_through() {
        let creds = StaticTokenCredentials::new("ghp_test");
        let got = creds.for_repo("acme/widgets").await.unwrap();
        assert_eq!(got.repo_full_name, "acme/widgets");
        assert_eq!(got.token, "ghp_test");
    }

    #[tokio::test]
    async fn rejects_bare_repo_id() {
        let creds = StaticTokenCredentials::new("ghp_test");
        assert!(creds.for_repo("widgets").await.is_err());
    }
}
