//! GitHub REST client used by the provisioning pipeline and the repository
//! endpoints.
//!
//! [`RepoClient`] is the seam: handlers and the provisioner only ever hold an
//! `Arc<dyn RepoClient>` built by a [`RepoClientFactory`] from the caller's
//! token, so tests substitute an in-memory double.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::errors::GitHubError;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("launchpad/", env!("CARGO_PKG_VERSION"));

/// Attempts `write_file` makes before giving up on a stale content hash.
pub const WRITE_ATTEMPTS: usize = 3;

// ── Wire types ───────────────────────────────────────────────────────

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    pub clone_url: String,
    pub ssh_url: String,
    pub private: bool,
    pub description: Option<String>,
}

impl Repository {
    /// Owner login, taken from `full_name`.
    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or_default()
    }
}

/// The user a token belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub public_repos: u64,
    #[serde(default)]
    pub owned_private_repos: Option<u64>,
}

/// Settings for a new repository. Auto-init is always off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepository {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub private: bool,
}

/// One content write.
#[derive(Debug, Clone, Copy)]
pub struct FileWrite<'a> {
    pub path: &'a str,
    pub content: &'a [u8],
    pub message: &'a str,
    pub branch: &'a str,
}

/// Result of a content write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub commit_sha: String,
    pub content_sha: Option<String>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: Option<ShaOnly>,
    commit: ShaOnly,
}

#[derive(Deserialize)]
struct ShaOnly {
    sha: String,
}

// ── Client seam ──────────────────────────────────────────────────────

#[async_trait]
pub trait RepoClient: Send + Sync {
    async fn current_user(&self) -> Result<GitHubUser, GitHubError>;

    /// Scopes granted to the token, from the `X-OAuth-Scopes` header of `/user`.
    async fn scopes(&self) -> Result<Vec<String>, GitHubError>;

    async fn create_repository(&self, repo: &NewRepository) -> Result<Repository, GitHubError>;

    /// The caller's repositories, most recently updated first.
    async fn list_repositories(&self, limit: usize) -> Result<Vec<Repository>, GitHubError>;

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository, GitHubError>;

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<(), GitHubError>;

    /// Current blob sha of `path` on `branch`, `None` when the file does not exist.
    async fn file_sha(
        &self,
        full_name: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, GitHubError>;

    /// Raw create (`sha` = None) or update of one file.
    async fn put_file(
        &self,
        full_name: &str,
        file: &FileWrite<'_>,
        sha: Option<&str>,
    ) -> Result<CommitRef, GitHubError>;

    async fn set_topics(&self, full_name: &str, topics: &[String]) -> Result<(), GitHubError>;

    /// Create a file that is expected not to exist yet.
    async fn create_file(
        &self,
        full_name: &str,
        file: &FileWrite<'_>,
    ) -> Result<CommitRef, GitHubError> {
        self.put_file(full_name, file, None).await
    }

    /// Create or update a file. A stale sha is re-read and retried.
    async fn write_file(
        &self,
        full_name: &str,
        file: &FileWrite<'_>,
    ) -> Result<CommitRef, GitHubError> {
        let mut attempt = 1;
        loop {
            let sha = self.file_sha(full_name, file.path, file.branch).await?;
            match self.put_file(full_name, file, sha.as_deref()).await {
                Err(GitHubError::Conflict(msg)) if attempt < WRITE_ATTEMPTS => {
                    tracing::debug!(repo = full_name, path = file.path, attempt, %msg, "stale sha, retrying write");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Builds a client bound to one user's token.
pub trait RepoClientFactory: Send + Sync {
    fn for_token(&self, token: &str) -> Arc<dyn RepoClient>;
}

// ── reqwest implementation ───────────────────────────────────────────

/// Shares one connection pool across every per-token client.
#[derive(Clone)]
pub struct GitHubClientFactory {
    http: reqwest::Client,
    api_url: Url,
}

impl GitHubClientFactory {
    pub fn new(api_url: &str) -> Result<Self, GitHubError> {
        let api_url = Url::parse(api_url)
            .map_err(|e| GitHubError::InvalidApiUrl(format!("{}: {}", api_url, e)))?;
        if api_url.cannot_be_a_base() {
            return Err(GitHubError::InvalidApiUrl(api_url.to_string()));
        }
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http, api_url })
    }

    pub fn client(&self, token: &str) -> GitHubClient {
        GitHubClient {
            http: self.http.clone(),
            api_url: self.api_url.clone(),
            token: token.to_string(),
        }
    }
}

impl RepoClientFactory for GitHubClientFactory {
    fn for_token(&self, token: &str) -> Arc<dyn RepoClient> {
        Arc::new(self.client(token))
    }
}

/// GitHub client holding nothing but the credential and a pooled HTTP client.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: Url,
    token: String,
}

impl GitHubClient {
    /// API url for `segments`, each percent-encoded as one path segment.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.api_url.clone();
        // Infallible: the factory rejects cannot-be-a-base urls.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `repos/{owner}/{repo}/contents/{path}`; `/` in `path` separates segments.
    fn contents_url(&self, full_name: &str, path: &str) -> Url {
        self.endpoint(
            ["repos"]
                .into_iter()
                .chain(full_name.split('/'))
                .chain(["contents"])
                .chain(path.split('/')),
        )
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, GitHubError> {
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let headers = resp.headers();
        let exhausted = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = resp.text().await.unwrap_or_default();

        Err(classify_error(
            status,
            error_message(&body),
            exhausted,
            retry_after,
        ))
    }
}

#[async_trait]
impl RepoClient for GitHubClient {
    async fn current_user(&self) -> Result<GitHubUser, GitHubError> {
        let resp = self.send(self.request(Method::GET, self.endpoint(["user"]))).await?;
        Ok(resp.json().await?)
    }

    async fn scopes(&self) -> Result<Vec<String>, GitHubError> {
        let resp = self.send(self.request(Method::GET, self.endpoint(["user"]))).await?;
        let header = resp
            .headers()
            .get("x-oauth-scopes")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Ok(parse_scopes(header))
    }

    async fn create_repository(&self, repo: &NewRepository) -> Result<Repository, GitHubError> {
        let body = serde_json::json!({
            "name": repo.name,
            "description": repo.description,
            "private": repo.private,
            "auto_init": false,
        });
        let resp = self
            .send(self.request(Method::POST, self.endpoint(["user", "repos"])).json(&body))
            .await?;
        Ok(resp.json().await?)
    }

    async fn list_repositories(&self, limit: usize) -> Result<Vec<Repository>, GitHubError> {
        let per_page = limit.clamp(1, 100).to_string();
        let req = self.request(Method::GET, self.endpoint(["user", "repos"])).query(&[
            ("sort", "updated"),
            ("direction", "desc"),
            ("per_page", per_page.as_str()),
        ]);
        let mut repos: Vec<Repository> = self.send(req).await?.json().await?;
        repos.truncate(limit);
        Ok(repos)
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository, GitHubError> {
        let url = self.endpoint(["repos", owner, name]);
        let resp = self.send(self.request(Method::GET, url)).await?;
        Ok(resp.json().await?)
    }

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<(), GitHubError> {
        let url = self.endpoint(["repos", owner, name]);
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn file_sha(
        &self,
        full_name: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, GitHubError> {
        let url = self.contents_url(full_name, path);
        let req = self.request(Method::GET, url).query(&[("ref", branch)]);
        match self.send(req).await {
            Ok(resp) => {
                let value: serde_json::Value = resp.json().await?;
                Ok(value
                    .get("sha")
                    .and_then(|s| s.as_str())
                    .map(String::from))
            }
            Err(GitHubError::NotFound(_)) => Ok(None),
            // An empty repository answers 409 for content reads.
            Err(GitHubError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_file(
        &self,
        full_name: &str,
        file: &FileWrite<'_>,
        sha: Option<&str>,
    ) -> Result<CommitRef, GitHubError> {
        let url = self.contents_url(full_name, file.path);
        let mut body = serde_json::json!({
            "message": file.message,
            "content": STANDARD.encode(file.content),
            "branch": file.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = serde_json::Value::String(sha.to_string());
        }
        let resp = self
            .send(self.request(Method::PUT, url).json(&body))
            .await?;
        let parsed: ContentsResponse = resp.json().await?;
        Ok(CommitRef {
            commit_sha: parsed.commit.sha,
            content_sha: parsed.content.map(|c| c.sha),
        })
    }

    async fn set_topics(&self, full_name: &str, topics: &[String]) -> Result<(), GitHubError> {
        let url = self.endpoint(
            ["repos"]
                .into_iter()
                .chain(full_name.split('/'))
                .chain(["topics"]),
        );
        let body = serde_json::json!({ "names": topics });
        self.send(self.request(Method::PUT, url).json(&body))
            .await?;
        Ok(())
    }
}

// ── Error mapping ────────────────────────────────────────────────────

/// Split an `X-OAuth-Scopes` header value into scope names.
pub fn parse_scopes(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Human-readable message from a GitHub error body.
///
/// Joins the top-level `message` with any `errors[].message` details.
pub fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        let trimmed = body.trim();
        return if trimmed.is_empty() {
            "no error details".to_string()
        } else {
            trimmed.to_string()
        };
    };

    let mut parts: Vec<String> = Vec::new();
    if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
        parts.push(msg.to_string());
    }
    if let Some(errors) = value.get("errors").and_then(|e| e.as_array()) {
        for err in errors {
            if let Some(msg) = err.get("message").and_then(|m| m.as_str()) {
                parts.push(msg.to_string());
            }
        }
    }
    if parts.is_empty() {
        "no error details".to_string()
    } else {
        parts.join(": ")
    }
}

/// Map a failed GitHub response onto [`GitHubError`].
pub fn classify_error(
    status: StatusCode,
    message: String,
    rate_limit_exhausted: bool,
    retry_after: Option<u64>,
) -> GitHubError {
    let lower = message.to_lowercase();
    match status.as_u16() {
        401 => GitHubError::Unauthorized(message),
        403 if rate_limit_exhausted || lower.contains("rate limit") => {
            GitHubError::RateLimited { retry_after }
        }
        403 => GitHubError::Forbidden(message),
        429 => GitHubError::RateLimited { retry_after },
        404 => GitHubError::NotFound(message),
        409 => GitHubError::Conflict(message),
        422 if lower.contains("already exists") || lower.contains("wasn't supplied") => {
            GitHubError::Conflict(message)
        }
        422 => GitHubError::Validation(message),
        other => GitHubError::Status {
            status: other,
            message,
        },
    }
}
