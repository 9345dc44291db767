use chrono::{DateTime, Utc};
use launchpad_common::ProjectConfig;
use serde::{Deserialize, Serialize};

use super::auth::AuthenticatedUser;
use super::github::{GitHubUser, Repository};
use super::provision::{BestEffort, ProvisionReport};
use super::store::ProjectRecord;

// ── Requests ─────────────────────────────────────────────────────────

/// Body of `POST {prefix}/github/repositories`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub private: bool,
    /// Topics to apply; omitted means the configured defaults.
    #[serde(default)]
    pub topics: Option<Vec<String>>,
    /// Extra template variables (database URL and keys).
    #[serde(default)]
    pub config: ProjectConfig,
}

/// Body of `PUT {prefix}/users/profile`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub email: Option<String>,
}

// ── Responses ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct UploadSummary {
    pub total_files: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub topics: BestEffort,
}

/// Repository summary returned once provisioning completes.
#[derive(Debug, Serialize)]
pub struct CreateRepositoryResponse {
    #[serde(flatten)]
    pub repository: Repository,
    pub upload: UploadSummary,
}

impl From<ProvisionReport> for CreateRepositoryResponse {
    fn from(report: ProvisionReport) -> Self {
        Self {
            upload: UploadSummary {
                total_files: report.total_files,
                uploaded: report.uploaded,
                failed: report.failed,
                topics: report.topics,
            },
            repository: report.repository,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TestAccessResponse {
    pub authenticated: bool,
    pub github_username: String,
    pub github_id: u64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub public_repos: u64,
    pub private_repos: Option<u64>,
    pub can_create_repos: bool,
    pub oauth_scopes: String,
    pub has_repo_scope: bool,
}

impl TestAccessResponse {
    pub fn new(user: GitHubUser, scopes: &[String]) -> Self {
        Self {
            authenticated: true,
            github_username: user.login,
            github_id: user.id,
            name: user.name,
            email: user.email,
            public_repos: user.public_repos,
            private_repos: user.owned_private_repos,
            can_create_repos: true,
            oauth_scopes: scopes.join(", "),
            has_repo_scope: scopes.iter().any(|s| s == "repo"),
        }
    }
}

/// Stored project plus the repository fields the dashboard reads.
#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    #[serde(flatten)]
    pub record: ProjectRecord,
    pub full_name: String,
    pub html_url: String,
    pub clone_url: String,
    pub ssh_url: String,
    pub private: bool,
    pub topics: Vec<String>,
}

impl From<ProjectRecord> for ProjectResponse {
    fn from(record: ProjectRecord) -> Self {
        Self {
            full_name: record.full_name(),
            html_url: record.github_repo_url.clone(),
            clone_url: record.clone_url(),
            ssh_url: record.ssh_url(),
            private: record.is_private,
            topics: record.github_topics.clone(),
            record,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub api: &'static str,
}

/// Identity carried by a verified bearer token.
#[derive(Debug, Serialize)]
pub struct CurrentUser {
    pub id: String,
    pub email: Option<String>,
    pub role: String,
}

impl From<AuthenticatedUser> for CurrentUser {
    fn from(user: AuthenticatedUser) -> Self {
        Self {
            id: user.id,
            email: user.email,
            role: user.role,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenCheck {
    pub valid: bool,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub role: String,
    /// Requested address awaiting confirmation by the identity provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_email: Option<String>,
}

impl From<AuthenticatedUser> for UserProfile {
    fn from(user: AuthenticatedUser) -> Self {
        Self {
            id: user.id,
            email: user.email,
            role: user.role,
            pending_email: None,
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct UserStats {
    pub project_count: usize,
    pub private_count: usize,
    pub deployed_count: usize,
    pub latest_project_at: Option<DateTime<Utc>>,
}

impl UserStats {
    pub fn from_projects(projects: &[ProjectRecord]) -> Self {
        Self {
            project_count: projects.len(),
            private_count: projects.iter().filter(|p| p.is_private).count(),
            deployed_count: projects.iter().filter(|p| p.vercel_deployed).count(),
            latest_project_at: projects.iter().map(|p| p.created_at).max(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserStatsResponse {
    pub user_id: String,
    pub stats: UserStats,
}

#[derive(Debug, Serialize)]
pub struct AccountDeletionResponse {
    pub message: String,
    pub deactivated_projects: usize,
}
