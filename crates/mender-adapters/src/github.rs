//! GitHub REST integration for review requests and remote branches.
//!
//! Authentication is a bearer token from [`HostingSettings`]; nothing here
//! reads the environment or retries. Callers wrap each operation in
//! `mender_core::retry` using [`HostingError::retry_decision`].

use crate::config::{HostingSettings, RepositorySlug, Secret};
use crate::util::sanitize_error_body;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mender_core::{parse_retry_after, RetryDecision};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_TIMEOUT_SECS: u64 = 60;
const USER_AGENT: &str = "mender";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostingError {
    #[error("GitHub request failed: {0}")]
    Network(String),
    #[error("GitHub rate limit exceeded: {detail}")]
    RateLimited {
        retry_after: Option<Duration>,
        detail: String,
    },
    #[error("GitHub server error ({status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("GitHub rejected the credentials ({status}): {detail}")]
    Unauthorized { status: u16, detail: String },
    #[error("GitHub API error ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("Failed to decode GitHub response: {0}")]
    Decode(String),
}

impl HostingError {
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            HostingError::Network(_) | HostingError::Server { .. } => RetryDecision::Retry,
            HostingError::RateLimited {
                retry_after: Some(delay),
                ..
            } => RetryDecision::RetryAfter(*delay),
            HostingError::RateLimited { .. } => RetryDecision::Retry,
            HostingError::Unauthorized { .. }
            | HostingError::Rejected { .. }
            | HostingError::Decode(_) => RetryDecision::Fatal,
        }
    }
}

/// An open pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub number: u64,
    pub url: String,
}

/// A commit on a remote branch that is not on its base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommit {
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBranch {
    pub name: String,
    pub head_sha: String,
    pub committed_at: Option<DateTime<Utc>>,
}

/// The hosting-service operations the Repository Mutator needs.
#[async_trait]
pub trait HostingService: Send + Sync {
    async fn find_open_review_request(
        &self,
        branch: &str,
    ) -> Result<Option<PullRequestInfo>, HostingError>;

    async fn create_review_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestInfo, HostingError>;

    async fn update_review_request(
        &self,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequestInfo, HostingError>;

    /// Commits on `branch` that are not on `base`, or `None` when the branch
    /// does not exist remotely.
    async fn branch_commits(
        &self,
        base: &str,
        branch: &str,
    ) -> Result<Option<Vec<RemoteCommit>>, HostingError>;

    /// Remote branches whose name starts with `prefix/`.
    async fn list_branches(&self, prefix: &str) -> Result<Vec<RemoteBranch>, HostingError>;

    /// Delete a remote branch. Deleting a branch that is already gone succeeds.
    async fn delete_branch(&self, branch: &str) -> Result<(), HostingError>;
}

#[derive(Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Serialize)]
struct UpdatePrRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct PrResponse {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct CompareResponse {
    #[serde(default)]
    commits: Vec<CompareCommit>,
}

#[derive(Deserialize)]
struct CompareCommit {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    #[serde(default)]
    message: String,
    committer: Option<CommitPerson>,
}

#[derive(Deserialize)]
struct CommitPerson {
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RefResponse {
    #[serde(rename = "ref")]
    name: String,
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Build a readable message from a GitHub error body.
fn error_detail(body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        let msg = if detail.is_empty() {
            api_error.message
        } else {
            format!("{}: {}", api_error.message, detail)
        };
        return sanitize_error_body(&msg);
    }
    sanitize_error_body(body)
}

fn classify_status(
    status: StatusCode,
    rate_limit_remaining: Option<&str>,
    retry_after: Option<&str>,
    body: &str,
) -> HostingError {
    let detail = error_detail(body);
    let code = status.as_u16();
    let rate_limited = code == 429
        || (code == 403
            && (rate_limit_remaining.map(str::trim) == Some("0")
                || body.to_lowercase().contains("rate limit")));

    if rate_limited {
        return HostingError::RateLimited {
            retry_after: parse_retry_after(retry_after, body),
            detail,
        };
    }
    match code {
        401 | 403 => HostingError::Unauthorized {
            status: code,
            detail,
        },
        500..=599 => HostingError::Server {
            status: code,
            detail,
        },
        _ => HostingError::Rejected {
            status: code,
            detail,
        },
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, HostingError> {
    serde_json::from_str(body).map_err(|e| HostingError::Decode(e.to_string()))
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: Secret,
    repository: RepositorySlug,
}

impl GitHubClient {
    pub fn new(settings: &HostingSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            repository: settings.repository.clone(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, self.repository.owner, self.repository.name, path
        )
    }

    /// Send a request and return the body. A 404 is `Ok(None)`.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        json: Option<serde_json::Value>,
    ) -> Result<Option<String>, HostingError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token.expose()))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(json) = json {
            request = request.json(&json);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HostingError::Network(e.without_url().to_string()))?;
        let status = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let remaining = header("x-ratelimit-remaining");
        let retry_after = header("retry-after");
        let body = response
            .text()
            .await
            .map_err(|e| HostingError::Network(e.without_url().to_string()))?;

        tracing::debug!(%method, status = status.as_u16(), "github api call");
        if status.is_success() {
            return Ok(Some(body));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Err(classify_status(
            status,
            remaining.as_deref(),
            retry_after.as_deref(),
            &body,
        ))
    }

    async fn send_expecting(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        json: Option<serde_json::Value>,
    ) -> Result<String, HostingError> {
        self.send(method, url, query, json)
            .await?
            .ok_or_else(|| HostingError::Rejected {
                status: 404,
                detail: "Not Found".to_string(),
            })
    }

    fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HostingError> {
        serde_json::to_value(value).map_err(|e| HostingError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HostingService for GitHubClient {
    async fn find_open_review_request(
        &self,
        branch: &str,
    ) -> Result<Option<PullRequestInfo>, HostingError> {
        let head = format!("{}:{}", self.repository.owner, branch);
        let body = self
            .send_expecting(
                Method::GET,
                &self.repo_url("pulls"),
                &[("state", "open"), ("head", head.as_str())],
                None,
            )
            .await?;
        let pulls: Vec<PrResponse> = decode(&body)?;
        Ok(pulls.into_iter().next().map(|pr| PullRequestInfo {
            number: pr.number,
            url: pr.html_url,
        }))
    }

    async fn create_review_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestInfo, HostingError> {
        let request = Self::to_json(&CreatePrRequest {
            title,
            body,
            head: branch,
            base,
        })?;
        let text = self
            .send_expecting(Method::POST, &self.repo_url("pulls"), &[], Some(request))
            .await?;
        let pr: PrResponse = decode(&text)?;
        Ok(PullRequestInfo {
            number: pr.number,
            url: pr.html_url,
        })
    }

    async fn update_review_request(
        &self,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequestInfo, HostingError> {
        let request = Self::to_json(&UpdatePrRequest { title, body })?;
        let text = self
            .send_expecting(
                Method::PATCH,
                &self.repo_url(&format!("pulls/{}", number)),
                &[],
                Some(request),
            )
            .await?;
        let pr: PrResponse = decode(&text)?;
        Ok(PullRequestInfo {
            number: pr.number,
            url: pr.html_url,
        })
    }

    async fn branch_commits(
        &self,
        base: &str,
        branch: &str,
    ) -> Result<Option<Vec<RemoteCommit>>, HostingError> {
        let url = self.repo_url(&format!("compare/{}...{}", base, branch));
        let Some(text) = self.send(Method::GET, &url, &[], None).await? else {
            return Ok(None);
        };
        let compare: CompareResponse = decode(&text)?;
        Ok(Some(
            compare
                .commits
                .into_iter()
                .map(|c| RemoteCommit {
                    sha: c.sha,
                    message: c.commit.message,
                })
                .collect(),
        ))
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<RemoteBranch>, HostingError> {
        let prefix = prefix.trim_end_matches('/');
        let url = self.repo_url(&format!("git/matching-refs/heads/{}/", prefix));
        let text = self.send_expecting(Method::GET, &url, &[], None).await?;
        let refs: Vec<RefResponse> = decode(&text)?;

        let mut branches = Vec::with_capacity(refs.len());
        for reference in refs {
            let name = reference
                .name
                .strip_prefix("refs/heads/")
                .unwrap_or(&reference.name)
                .to_string();
            let commit_url = self.repo_url(&format!("commits/{}", reference.object.sha));
            let committed_at = match self.send(Method::GET, &commit_url, &[], None).await? {
                Some(text) => decode::<CommitResponse>(&text)?
                    .commit
                    .committer
                    .and_then(|c| c.date),
                None => None,
            };
            branches.push(RemoteBranch {
                name,
                head_sha: reference.object.sha,
                committed_at,
            });
        }
        Ok(branches)
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), HostingError> {
        let url = self.repo_url(&format!("git/refs/heads/{}", branch));
        match self.send(Method::DELETE, &url, &[], None).await {
            Ok(_) => Ok(()),
            // 422 "Reference does not exist"
            Err(HostingError::Rejected { status: 422, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GitHubClient {
        let settings = HostingSettings {
            token: Secret::new("ghs_test_token"),
            repository: RepositorySlug::parse("acme/widgets").unwrap(),
            api_url: server.uri(),
            server_url: "https://github.com".to_string(),
            base_branch: "main".to_string(),
            branch_prefix: "fix/ai-heal".to_string(),
        };
        GitHubClient::new(&settings).unwrap()
    }

    #[tokio::test]
    async fn test_create_review_request_sends_expected_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/pulls"))
            .and(header("authorization", "Bearer ghs_test_token"))
            .and(header("x-github-api-version", "2022-11-28"))
            .and(body_partial_json(json!({
                "head": "fix/ai-heal/1-abc",
                "base": "main",
                "title": "Automated fix"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "number": 12,
                "html_url": "https://github.com/acme/widgets/pull/12"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pr = client_for(&server)
            .create_review_request("fix/ai-heal/1-abc", "main", "Automated fix", "body")
            .await
            .unwrap();
        assert_eq!(pr.number, 12);
        assert_eq!(pr.url, "https://github.com/acme/widgets/pull/12");
    }

    #[tokio::test]
    async fn test_find_open_review_request_filters_by_head() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/pulls"))
            .and(query_param("state", "open"))
            .and(query_param("head", "acme:fix/ai-heal/1-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"number": 3, "html_url": "https://github.com/acme/widgets/pull/3"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/pulls"))
            .and(query_param("head", "acme:fix/other"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let found = client.find_open_review_request("fix/ai-heal/1-abc").await.unwrap();
        assert_eq!(found.map(|pr| pr.number), Some(3));
        assert!(client.find_open_review_request("fix/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_branch_commits_missing_branch_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/compare/main...fix/ai-heal/9-abc"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/compare/main...fix/ai-heal/1-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ahead",
                "commits": [
                    {"sha": "abc123", "commit": {"message": "fix\n\nRemediated-By: mender"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client
            .branch_commits("main", "fix/ai-heal/9-abc")
            .await
            .unwrap()
            .is_none());
        let commits = client
            .branch_commits("main", "fix/ai-heal/1-abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].message.contains("Remediated-By"));
    }

    #[tokio::test]
    async fn test_list_branches_reads_commit_dates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/git/matching-refs/heads/fix/ai-heal/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"ref": "refs/heads/fix/ai-heal/1-abc", "object": {"sha": "s1"}}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/commits/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sha": "s1",
                "commit": {"message": "m", "committer": {"date": "2024-01-02T03:04:05Z"}}
            })))
            .mount(&server)
            .await;

        let branches = client_for(&server).list_branches("fix/ai-heal").await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "fix/ai-heal/1-abc");
        assert_eq!(
            branches[0].committed_at.map(|d| d.to_rfc3339()),
            Some("2024-01-02T03:04:05+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/widgets/pulls/1"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("retry-after", "12")
                    .set_body_json(json!({"message": "API rate limit exceeded"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/widgets/pulls/2"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"message": "Requires authentication"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/widgets/pulls/3"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/widgets/pulls/4"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "message": "Validation Failed",
                "errors": [{"message": "A pull request already exists"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let limited = client.update_review_request(1, "t", "b").await.unwrap_err();
        assert_eq!(
            limited.retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(12))
        );
        let unauthorized = client.update_review_request(2, "t", "b").await.unwrap_err();
        assert!(matches!(unauthorized, HostingError::Unauthorized { status: 401, .. }));
        assert_eq!(unauthorized.retry_decision(), RetryDecision::Fatal);
        let server_error = client.update_review_request(3, "t", "b").await.unwrap_err();
        assert_eq!(server_error.retry_decision(), RetryDecision::Retry);
        let rejected = client.update_review_request(4, "t", "b").await.unwrap_err();
        assert_eq!(
            rejected.to_string(),
            "GitHub API error (422): Validation Failed: A pull request already exists"
        );
    }

    #[tokio::test]
    async fn test_delete_missing_branch_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/repos/acme/widgets/git/refs/heads/fix/ai-heal/old"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "message": "Reference does not exist"
            })))
            .mount(&server)
            .await;
        client_for(&server)
            .delete_branch("fix/ai-heal/old")
            .await
            .unwrap();
    }

    #[test]
    fn test_error_detail_redacts_credentials() {
        let detail = error_detail(r#"{"message":"Bad credentials for ghs_abcdef"}"#);
        assert!(detail.contains("redacted"));
    }
}
