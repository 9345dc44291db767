//! Typed error hierarchy for Launchpad.
//!
//! Four top-level enums cover the four collaborators:
//! - `GitHubError`: failures reported by the source-control provider
//! - `ProvisionError`: fatal outcomes of a provisioning job
//! - `AuthError`: bearer-token and credential header failures
//! - `StoreError`: project-record store failures

use thiserror::Error;

/// Errors from the GitHub REST API.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub rejected the credential: {0}")]
    Unauthorized(String),

    #[error("GitHub denied access: {0}")]
    Forbidden(String),

    #[error("Not found on GitHub: {0}")]
    NotFound(String),

    #[error("Conflict on GitHub: {0}")]
    Conflict(String),

    #[error("GitHub rejected the request: {0}")]
    Validation(String),

    #[error("GitHub rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("GitHub API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid GitHub API url: {0}")]
    InvalidApiUrl(String),
}

/// Fatal outcomes of a provisioning job. Only repository creation can fail a
/// job; everything after it degrades gracefully.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("A repository with the name '{name}' already exists in your account.")]
    NameTaken { name: String },

    #[error("GitHub token is invalid or expired. Please reconnect your GitHub account.")]
    CredentialRejected,

    #[error("Insufficient permissions. Current scopes: {scopes}. Error: {message}")]
    MissingScope { scopes: String, message: String },

    #[error("Invalid repository name or settings: {0}")]
    InvalidRequest(String),

    #[error("GitHub rate limit exceeded. Please try again later.")]
    RateLimited { retry_after: Option<u64> },

    #[error("Failed to create repository: {0}")]
    Provider(#[source] GitHubError),

    #[error("Provisioning task aborted: {0}")]
    TaskAborted(String),
}

/// Errors from bearer-token verification and credential headers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid token payload")]
    MissingSubject,

    #[error("GitHub token not found. Please authenticate with GitHub first.")]
    MissingGitHubToken,

    #[error("Unsupported JWT algorithm '{0}'")]
    UnsupportedAlgorithm(String),
}

/// Errors from the project-record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Store returned status {status}: {message}")]
    Status { status: u16, message: String },
}
