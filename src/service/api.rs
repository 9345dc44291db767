use std::sync::{Arc, LazyLock};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use regex::Regex;

use super::auth::{AuthenticatedUser, GitHubToken, JwtVerifier};
use super::github::{NewRepository, RepoClientFactory};
use super::models::{
    AccountDeletionResponse, CreateRepositoryRequest, CreateRepositoryResponse, CurrentUser,
    HealthResponse, MessageResponse, ProfileUpdate, ProjectResponse, TestAccessResponse,
    TokenCheck, UserProfile, UserStats, UserStatsResponse,
};
use super::progress::ProgressChannel;
use super::provision::{ProvisionRequest, Provisioner};
use super::store::{ProjectStore, ProjectUpdate};
use crate::errors::{AuthError, GitHubError, ProvisionError, StoreError};

/// Repositories returned by the list endpoint.
pub const LIST_LIMIT: usize = 20;
const DELETE_SCOPE: &str = "delete_repo";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub project_name: String,
    pub verifier: JwtVerifier,
    pub github: Arc<dyn RepoClientFactory>,
    pub progress: Arc<ProgressChannel>,
    pub provisioner: Provisioner,
    /// `None` when no database is configured.
    pub store: Option<Arc<dyn ProjectStore>>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    TooManyRequests {
        message: String,
        retry_after: Option<u64>,
    },
    ServiceUnavailable(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::TooManyRequests {
                message,
                retry_after: secs,
            } => {
                retry_after = secs;
                (StatusCode::TOO_MANY_REQUESTS, message)
            }
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let mut response = (status, Json(serde_json::json!({"error": message}))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::UnsupportedAlgorithm(_) => ApiError::Internal(e.to_string()),
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        let message = e.to_string();
        match e {
            ProvisionError::NameTaken { .. } => ApiError::Conflict(message),
            ProvisionError::CredentialRejected => ApiError::Unauthorized(message),
            ProvisionError::MissingScope { .. } => ApiError::Forbidden(message),
            ProvisionError::InvalidRequest(_) => ApiError::Unprocessable(message),
            ProvisionError::RateLimited { retry_after } => ApiError::TooManyRequests {
                message,
                retry_after,
            },
            ProvisionError::Provider(_) => ApiError::BadGateway(message),
            ProvisionError::TaskAborted(_) => ApiError::Internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ProjectNotFound { .. } => ApiError::NotFound("Project not found".into()),
            other => {
                tracing::error!(error = %other, "project store request failed");
                ApiError::Internal(format!("Failed to access projects: {}", other))
            }
        }
    }
}

fn github_error(e: GitHubError, context: &str) -> ApiError {
    match e {
        GitHubError::Unauthorized(_) => ApiError::Unauthorized(
            "GitHub token is invalid or expired. Please reconnect your GitHub account.".into(),
        ),
        GitHubError::Forbidden(msg) => ApiError::Forbidden(format!("Permission denied: {}", msg)),
        GitHubError::NotFound(msg) => ApiError::NotFound(msg),
        GitHubError::Conflict(msg) => ApiError::Conflict(msg),
        GitHubError::Validation(msg) => ApiError::Unprocessable(msg),
        GitHubError::RateLimited { retry_after } => ApiError::TooManyRequests {
            message: "GitHub rate limit exceeded. Please try again later.".into(),
            retry_after,
        },
        other => ApiError::BadGateway(format!("{}: {}", context, other)),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(prefix: &str) -> Router<SharedState> {
    let prefix = prefix.trim_end_matches('/');
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route(&format!("{prefix}/github/health"), get(github_health))
        .route(&format!("{prefix}/github/test-access"), get(test_access))
        .route(
            &format!("{prefix}/github/repositories"),
            get(list_repositories).post(create_repository),
        )
        .route(
            &format!("{prefix}/github/repositories/{{owner}}/{{repo}}"),
            delete(delete_repository),
        )
        .route(&format!("{prefix}/projects"), get(list_projects))
        .route(
            &format!("{prefix}/projects/{{id}}"),
            get(get_project).patch(update_project),
        )
        .route(&format!("{prefix}/auth/me"), get(current_user))
        .route(&format!("{prefix}/auth/verify"), get(verify_token))
        .route(
            &format!("{prefix}/users/profile"),
            get(user_profile).put(update_profile),
        )
        .route(&format!("{prefix}/users/stats"), get(user_stats))
        .route(&format!("{prefix}/users/account"), delete(delete_account))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn root(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": format!("{} API", state.project_name),
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let connected = match &state.store {
        Some(store) => match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "database health check failed");
                false
            }
        },
        None => false,
    };
    Json(HealthResponse {
        status: if connected { "healthy" } else { "degraded" },
        database: if connected { "connected" } else { "disconnected" },
        api: "operational",
    })
}

async fn github_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "github"}))
}

async fn test_access(
    State(state): State<SharedState>,
    _user: AuthenticatedUser,
    GitHubToken(token): GitHubToken,
) -> Result<impl IntoResponse, ApiError> {
    let client = state.github.for_token(&token);
    let user = client.current_user().await.map_err(|e| match e {
        GitHubError::Unauthorized(_) => ApiError::Unauthorized(
            "Token verification failed. The token may be expired or invalid.".into(),
        ),
        other => github_error(other, "GitHub API error"),
    })?;
    let scopes = client.scopes().await.unwrap_or_default();
    Ok(Json(TestAccessResponse::new(user, &scopes)))
}

async fn create_repository(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
    GitHubToken(token): GitHubToken,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Repository name must not be empty".into()));
    }

    let client = state.github.for_token(&token);
    let report = state
        .provisioner
        .provision(
            client,
            ProvisionRequest {
                user_id: user.id,
                repository: NewRepository {
                    name,
                    description: req.description,
                    private: req.private,
                },
                overrides: req.config,
                topics: req.topics,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(CreateRepositoryResponse::from(report))))
}

async fn list_repositories(
    State(state): State<SharedState>,
    _user: AuthenticatedUser,
    GitHubToken(token): GitHubToken,
) -> Result<impl IntoResponse, ApiError> {
    let repos = state
        .github
        .for_token(&token)
        .list_repositories(LIST_LIMIT)
        .await
        .map_err(|e| github_error(e, "Failed to list repositories"))?;
    Ok(Json(repos))
}

async fn delete_repository(
    State(state): State<SharedState>,
    _user: AuthenticatedUser,
    GitHubToken(token): GitHubToken,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let client = state.github.for_token(&token);

    let me = client
        .current_user()
        .await
        .map_err(|e| github_error(e, "Failed to delete repository"))?;
    if me.login != owner {
        return Err(ApiError::Forbidden(
            "You can only delete repositories you own.".into(),
        ));
    }

    // Classic tokens report their scopes; fine-grained ones send none.
    let scopes = client.scopes().await.unwrap_or_default();
    if !scopes.is_empty() && !scopes.iter().any(|s| s == DELETE_SCOPE) {
        return Err(missing_delete_scope(&scopes));
    }

    client
        .get_repository(&owner, &repo)
        .await
        .map_err(|e| not_found_or(e, &owner, &repo))?;

    match client.delete_repository(&owner, &repo).await {
        Ok(()) => {
            tracing::info!(repo = %format!("{}/{}", owner, repo), "repository deleted");
            Ok(Json(MessageResponse {
                message: format!("Repository {}/{} deleted successfully.", owner, repo),
            }))
        }
        Err(GitHubError::Forbidden(msg)) => {
            let scopes = client.scopes().await.unwrap_or_default();
            if scopes.iter().any(|s| s == DELETE_SCOPE) {
                Err(ApiError::Forbidden(format!("Permission denied: {}", msg)))
            } else {
                Err(missing_delete_scope(&scopes))
            }
        }
        Err(e) => Err(not_found_or(e, &owner, &repo)),
    }
}

fn missing_delete_scope(scopes: &[String]) -> ApiError {
    let current = if scopes.is_empty() {
        "none".to_string()
    } else {
        scopes.join(", ")
    };
    ApiError::Forbidden(format!(
        "Repository deletion requires the '{}' scope. Current scopes: {}. \
         To delete repositories, you'll need to update your GitHub OAuth permissions to include '{}'.",
        DELETE_SCOPE, current, DELETE_SCOPE
    ))
}

fn not_found_or(e: GitHubError, owner: &str, repo: &str) -> ApiError {
    match e {
        GitHubError::NotFound(_) => {
            ApiError::NotFound(format!("Repository {}/{} not found.", owner, repo))
        }
        other => github_error(other, "Failed to delete repository"),
    }
}

fn require_store(state: &AppState) -> Result<&Arc<dyn ProjectStore>, ApiError> {
    state
        .store
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Database service is unavailable".into()))
}

async fn list_projects(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    let projects = require_store(&state)?.list_active(&user.id).await?;
    let projects: Vec<ProjectResponse> = projects.into_iter().map(ProjectResponse::from).collect();
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = require_store(&state)?.get(&user.id, &id).await?;
    Ok(Json(ProjectResponse::from(project)))
}

async fn update_project(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Json(update): Json<ProjectUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let project = require_store(&state)?.update(&user.id, &id, &update).await?;
    Ok(Json(ProjectResponse::from(project)))
}

async fn current_user(user: AuthenticatedUser) -> Json<CurrentUser> {
    Json(CurrentUser::from(user))
}

async fn verify_token(user: AuthenticatedUser) -> Json<TokenCheck> {
    Json(TokenCheck {
        valid: true,
        user_id: user.id,
    })
}

async fn user_profile(user: AuthenticatedUser) -> Json<UserProfile> {
    Json(UserProfile::from(user))
}

/// Email changes are confirmed by the identity provider before they show up
/// in issued tokens, so the new address is echoed back as pending.
async fn update_profile(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    require_store(&state)?;
    let pending_email = match update.email.map(|e| e.trim().to_string()) {
        Some(email) if !EMAIL_RE.is_match(&email) => {
            return Err(ApiError::Unprocessable(format!(
                "Invalid email address: {}",
                email
            )));
        }
        Some(email) if user.email.as_deref() == Some(email.as_str()) => None,
        other => other,
    };
    if let Some(email) = &pending_email {
        tracing::info!(user_id = %user.id, email = %email, "email change requested");
    }

    let mut profile = UserProfile::from(user);
    profile.pending_email = pending_email;
    Ok(Json(profile))
}

async fn user_stats(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    let projects = require_store(&state)?.list_active(&user.id).await?;
    Ok(Json(UserStatsResponse {
        stats: UserStats::from_projects(&projects),
        user_id: user.id,
    }))
}

/// Deactivate every project of the caller. Removing the identity itself is
/// left to the identity provider.
async fn delete_account(
    State(state): State<SharedState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    let store = require_store(&state)?;
    let deactivate = ProjectUpdate {
        is_active: Some(false),
        ..ProjectUpdate::default()
    };

    let projects = store.list_active(&user.id).await?;
    for project in &projects {
        store.update(&user.id, &project.id, &deactivate).await?;
    }
    tracing::info!(user_id = %user.id, projects = projects.len(), "account deletion initiated");

    Ok(Json(AccountDeletionResponse {
        message: "Account deletion initiated. This may take a few moments to complete.".into(),
        deactivated_projects: projects.len(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────
