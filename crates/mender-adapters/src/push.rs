//! Pushing work branches to the hosting service (shells out to git).

use crate::util::{redact, run_command_with_timeout, sanitize_error_body};
use async_trait::async_trait;
use mender_core::RetryDecision;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const GIT_PUSH_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("push blocked: sandbox mode is active (MENDER_DISABLE_PUSH=1)")]
    Disabled,
    #[error("git push timed out after {0}s")]
    TimedOut(u64),
    #[error("git push could not reach the remote: {0}")]
    Network(String),
    #[error("git push was not authorized: {0}")]
    Unauthorized(String),
    #[error("git push was rejected: {0}")]
    Rejected(String),
    #[error("failed to run git push: {0}")]
    Spawn(String),
}

impl PushError {
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            PushError::TimedOut(_) | PushError::Network(_) => RetryDecision::Retry,
            PushError::Disabled
            | PushError::Unauthorized(_)
            | PushError::Rejected(_)
            | PushError::Spawn(_) => RetryDecision::Fatal,
        }
    }

    /// Classify git's stderr for a failed push.
    fn from_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let detail = sanitize_error_body(stderr);
        if lower.contains("authentication failed")
            || lower.contains("could not read username")
            || lower.contains("permission to")
            || lower.contains("403")
        {
            PushError::Unauthorized(detail)
        } else if lower.contains("could not resolve host")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("early eof")
            || lower.contains("the remote end hung up")
            || lower.contains("502")
            || lower.contains("503")
        {
            PushError::Network(detail)
        } else {
            PushError::Rejected(detail)
        }
    }
}

/// Publishes a local branch to the remote.
#[async_trait]
pub trait BranchPusher: Send + Sync {
    /// Push `branch`, replacing the remote branch of the same name.
    async fn push(&self, repo_path: &Path, branch: &str) -> Result<(), PushError>;
}

/// `git push --force` to a token-authenticated HTTPS URL.
#[derive(Clone)]
pub struct GitCliPusher {
    remote_url: String,
    token: String,
    disabled: bool,
    timeout: Duration,
}

impl std::fmt::Debug for GitCliPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCliPusher")
            .field("remote_url", &redact(&self.remote_url, &self.token))
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl GitCliPusher {
    /// `server_url` is the hosting web root (`https://github.com`), `repository`
    /// is `owner/name`.
    pub fn new(
        server_url: &str,
        repository: &str,
        token: &str,
        disabled: bool,
    ) -> anyhow::Result<Self> {
        let mut url = url::Url::parse(server_url)
            .map_err(|e| anyhow::anyhow!("Invalid server URL '{}': {}", server_url, e))?;
        url.set_path(&format!("{}.git", repository.trim_matches('/')));
        if !token.is_empty() {
            url.set_username("x-access-token")
                .map_err(|_| anyhow::anyhow!("Cannot embed credentials in '{}'", server_url))?;
            url.set_password(Some(token))
                .map_err(|_| anyhow::anyhow!("Cannot embed credentials in '{}'", server_url))?;
        }
        Ok(Self {
            remote_url: url.to_string(),
            token: token.to_string(),
            disabled,
            timeout: Duration::from_secs(GIT_PUSH_TIMEOUT_SECS),
        })
    }

    /// Push to a plain remote (path or URL) without credentials.
    pub fn to_remote(remote: &str, disabled: bool) -> Self {
        Self {
            remote_url: remote.to_string(),
            token: String::new(),
            disabled,
            timeout: Duration::from_secs(GIT_PUSH_TIMEOUT_SECS),
        }
    }

    fn run(
        repo_path: PathBuf,
        remote_url: String,
        token: String,
        branch: String,
        timeout: Duration,
    ) -> Result<(), PushError> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        let mut cmd = Command::new("git");
        cmd.current_dir(&repo_path)
            .args(["push", "--force", "--porcelain"])
            .arg(&remote_url)
            .arg(&refspec)
            .env("GIT_TERMINAL_PROMPT", "0");

        let output = run_command_with_timeout(&mut cmd, timeout)
            .map_err(|e| PushError::Spawn(redact(&e, &token)))?;

        if output.timed_out {
            return Err(PushError::TimedOut(timeout.as_secs()));
        }
        if output.success() {
            return Ok(());
        }
        Err(PushError::from_stderr(&redact(&output.stderr, &token)))
    }
}

#[async_trait]
impl BranchPusher for GitCliPusher {
    async fn push(&self, repo_path: &Path, branch: &str) -> Result<(), PushError> {
        if self.disabled {
            return Err(PushError::Disabled);
        }
        let repo_path = repo_path.to_path_buf();
        let remote_url = self.remote_url.clone();
        let token = self.token.clone();
        let branch = branch.to_string();
        let timeout = self.timeout;

        tracing::debug!(branch = %branch, "pushing work branch");
        tokio::task::spawn_blocking(move || {
            Self::run(repo_path, remote_url, token, branch, timeout)
        })
        .await
        .map_err(|e| PushError::Spawn(e.to_string()))?
    }
}
