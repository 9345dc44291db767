//! Repository provisioning pipeline.
//!
//! One job creates a bare repository, renders the template set for it,
//! commits a placeholder README, uploads the rendered files in paced batches
//! and applies topics, publishing milestones to the owner's live connections.
//! Only repository creation can fail a job. Once the repository exists the
//! job runs to completion on its own task, even if the caller goes away.

use std::sync::Arc;
use std::time::Duration;

use launchpad_common::{JobPhase, ProgressEvent, ProjectConfig, TemplateFile};
use serde::Serialize;

use super::github::{FileWrite, NewRepository, RepoClient, Repository};
use super::progress::ProgressChannel;
use super::store::{NewProject, ProjectStore};
use super::template::TemplateRenderer;
use crate::config::ProvisioningSettings;
use crate::errors::{GitHubError, ProvisionError};

const README_PATH: &str = "README.md";
const TEMPLATE_VERSION: &str = "1.0.0";

/// Pacing and commit settings for provisioning jobs.
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub progress_every: usize,
    pub branch: String,
    pub commit_message: String,
    pub default_topics: Vec<String>,
}

impl From<&ProvisioningSettings> for ProvisionOptions {
    fn from(settings: &ProvisioningSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            batch_pause: settings.batch_pause(),
            progress_every: settings.progress_every.max(1),
            branch: settings.default_branch.clone(),
            commit_message: settings.commit_message.clone(),
            default_topics: settings.topics.clone(),
        }
    }
}

/// One provisioning request.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub user_id: String,
    pub repository: NewRepository,
    /// Template variables supplied by the caller. Name, owner and URL are
    /// always taken from the created repository.
    pub overrides: ProjectConfig,
    /// `None` applies the configured default topics.
    pub topics: Option<Vec<String>>,
}

/// Outcome of a step whose failure does not fail the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum BestEffort {
    Applied,
    Skipped,
    Failed(String),
}

/// Summary returned once a job reaches `complete`.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub repository: Repository,
    pub total_files: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub phase: JobPhase,
    pub topics: BestEffort,
}

/// Move a job from `from` to `to` if the transition is allowed, returning
/// the phase the job is in afterwards.
fn transition(from: JobPhase, to: JobPhase, user_id: &str, repo: &str) -> JobPhase {
    if from.is_terminal() {
        tracing::warn!(user_id, repo, phase = %from, to = %to, "job already finished");
        return from;
    }
    if !from.can_advance_to(to) {
        tracing::warn!(user_id, repo, from = %from, to = %to, "ignored out-of-order phase transition");
        return from;
    }
    tracing::debug!(user_id, repo, from = %from, to = %to, "job phase");
    to
}

/// A request that has been accepted but has no repository yet.
#[derive(Debug)]
struct AcceptedJob {
    user_id: String,
    name: String,
}

impl AcceptedJob {
    /// Repository creation failed; the job ends here.
    fn fail(self) -> JobPhase {
        transition(JobPhase::Accepted, JobPhase::Error, &self.user_id, &self.name)
    }

    fn created(self, repository: Repository) -> ProvisioningJob {
        let mut job = ProvisioningJob {
            user_id: self.user_id,
            repository,
            files: Vec::new(),
            uploaded: 0,
            failed: 0,
            phase: JobPhase::Accepted,
        };
        job.advance(JobPhase::RepoCreated);
        job
    }
}

/// Transient per-job state once the repository exists. Never persisted.
#[derive(Debug)]
struct ProvisioningJob {
    user_id: String,
    repository: Repository,
    files: Vec<TemplateFile>,
    uploaded: usize,
    failed: usize,
    phase: JobPhase,
}

impl ProvisioningJob {
    fn total(&self) -> usize {
        self.files.len()
    }

    fn advance(&mut self, next: JobPhase) {
        self.phase = transition(self.phase, next, &self.user_id, &self.repository.full_name);
    }
}

/// Runs provisioning jobs. Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct Provisioner {
    renderer: Arc<TemplateRenderer>,
    progress: Arc<ProgressChannel>,
    store: Option<Arc<dyn ProjectStore>>,
    options: Arc<ProvisionOptions>,
}

impl Provisioner {
    pub fn new(
        renderer: Arc<TemplateRenderer>,
        progress: Arc<ProgressChannel>,
        options: ProvisionOptions,
    ) -> Self {
        Self {
            renderer,
            progress,
            store: None,
            options: Arc::new(options),
        }
    }

    /// Record each provisioned project in `store`.
    pub fn with_store(mut self, store: Arc<dyn ProjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run a job to completion on its own task and wait for the report.
    pub async fn provision(
        &self,
        client: Arc<dyn RepoClient>,
        request: ProvisionRequest,
    ) -> Result<ProvisionReport, ProvisionError> {
        let this = self.clone();
        tokio::spawn(async move { this.run(client, request).await })
            .await
            .map_err(|e| ProvisionError::TaskAborted(e.to_string()))?
    }

    async fn run(
        &self,
        client: Arc<dyn RepoClient>,
        request: ProvisionRequest,
    ) -> Result<ProvisionReport, ProvisionError> {
        let ProvisionRequest {
            user_id,
            repository: new_repo,
            overrides,
            topics,
        } = request;

        let accepted = AcceptedJob {
            user_id,
            name: new_repo.name.clone(),
        };
        let repository = match client.create_repository(&new_repo).await {
            Ok(repo) => repo,
            Err(e) => {
                tracing::warn!(user_id = %accepted.user_id, repo = %new_repo.name, error = %e, "repository creation failed");
                let phase = accepted.fail();
                tracing::debug!(repo = %new_repo.name, phase = %phase, "job finished");
                return Err(creation_failure(client.as_ref(), &new_repo.name, e).await);
            }
        };
        tracing::info!(user_id = %accepted.user_id, repo = %repository.full_name, "repository created");

        let mut job = accepted.created(repository);
        self.publish(
            &job,
            ProgressEvent::RepositoryCreated {
                name: job.repository.name.clone(),
                full_name: job.repository.full_name.clone(),
                html_url: job.repository.html_url.clone(),
            },
        );

        self.prepare_template(&mut job, &overrides).await;
        self.initial_commit(client.as_ref(), &mut job).await;
        self.upload(client.as_ref(), &mut job).await;

        let topics = topics.unwrap_or_else(|| self.options.default_topics.clone());
        let topics_outcome = apply_topics(client.as_ref(), &job.repository, &topics).await;
        job.advance(JobPhase::TopicsSet);

        self.record_project(&job, &topics).await;

        job.advance(JobPhase::Complete);
        self.publish(
            &job,
            ProgressEvent::UploadComplete {
                total_files: job.total(),
                uploaded: job.uploaded,
                failed: job.failed,
                repo_url: job.repository.html_url.clone(),
            },
        );
        tracing::info!(
            user_id = %job.user_id,
            repo = %job.repository.full_name,
            total = job.total(),
            uploaded = job.uploaded,
            failed = job.failed,
            "provisioning complete"
        );

        Ok(ProvisionReport {
            total_files: job.total(),
            uploaded: job.uploaded,
            failed: job.failed,
            phase: job.phase,
            topics: topics_outcome,
            repository: job.repository,
        })
    }

    fn publish(&self, job: &ProvisioningJob, event: ProgressEvent) {
        self.progress.publish(&job.user_id, &event);
    }

    async fn prepare_template(&self, job: &mut ProvisioningJob, overrides: &ProjectConfig) {
        self.publish(
            job,
            ProgressEvent::PreparingTemplate {
                message: "Preparing template files...".to_string(),
            },
        );

        let config = project_config(&job.repository, overrides);
        let renderer = self.renderer.clone();
        job.files = tokio::task::spawn_blocking(move || renderer.render(&config))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "template rendering task failed, uploading nothing");
                Vec::new()
            });

        job.advance(JobPhase::TemplatePrepared);
        self.publish(
            job,
            ProgressEvent::TemplateReady {
                total_files: job.total(),
            },
        );
    }

    /// Commit a placeholder README so the default branch exists.
    async fn initial_commit(&self, client: &dyn RepoClient, job: &mut ProvisioningJob) {
        let readme = format!(
            "# {}\n\n{}\n",
            job.repository.name,
            job.repository.description.as_deref().unwrap_or_default()
        );
        let write = FileWrite {
            path: README_PATH,
            content: readme.as_bytes(),
            message: &self.options.commit_message,
            branch: &self.options.branch,
        };
        if let Err(e) = client.create_file(&job.repository.full_name, &write).await {
            tracing::warn!(repo = %job.repository.full_name, error = %e, "could not create initial README");
        }
        job.advance(JobPhase::InitialCommit);
    }

    async fn upload(&self, client: &dyn RepoClient, job: &mut ProvisioningJob) {
        job.advance(JobPhase::Uploading);
        let total = job.total();
        self.publish(job, ProgressEvent::UploadStarted { total_files: total });

        let files = std::mem::take(&mut job.files);
        let mut index = 0;
        for (batch_no, batch) in files.chunks(self.options.batch_size).enumerate() {
            if batch_no > 0 && !self.options.batch_pause.is_zero() {
                tokio::time::sleep(self.options.batch_pause).await;
            }
            for file in batch {
                index += 1;
                let write = FileWrite {
                    path: &file.path,
                    content: file.as_bytes(),
                    message: &self.options.commit_message,
                    branch: &self.options.branch,
                };
                let full_name = &job.repository.full_name;
                let result = if file.path == README_PATH {
                    client.write_file(full_name, &write).await
                } else {
                    client.create_file(full_name, &write).await
                };

                match result {
                    Ok(_) => job.uploaded += 1,
                    Err(e) => {
                        job.failed += 1;
                        tracing::warn!(
                            user_id = %job.user_id,
                            repo = %full_name,
                            path = %file.path,
                            error = %e,
                            "file upload failed"
                        );
                        self.publish(
                            job,
                            ProgressEvent::FileError {
                                path: file.path.clone(),
                                error: e.to_string(),
                            },
                        );
                    }
                }

                if index % self.options.progress_every == 0 || index == total {
                    self.publish(job, ProgressEvent::upload_progress(index, total));
                }
            }
        }
        job.files = files;
    }

    async fn record_project(&self, job: &ProvisioningJob, topics: &[String]) {
        let Some(store) = &self.store else {
            return;
        };
        let project = NewProject {
            user_id: job.user_id.clone(),
            name: job.repository.name.clone(),
            description: job.repository.description.clone(),
            github_repo_url: job.repository.html_url.clone(),
            github_repo_id: job.repository.id,
            is_private: job.repository.private,
            github_topics: topics.to_vec(),
            template_version: TEMPLATE_VERSION.to_string(),
        };
        if let Err(e) = store.insert(&project).await {
            tracing::warn!(repo = %job.repository.full_name, error = %e, "could not record project");
        }
    }
}

/// Variables for one job: caller overrides plus the repository's identity.
fn project_config(repository: &Repository, overrides: &ProjectConfig) -> ProjectConfig {
    ProjectConfig {
        name: Some(repository.name.clone()),
        description: overrides
            .description
            .clone()
            .or_else(|| repository.description.clone()),
        github_username: Some(repository.owner().to_string()),
        repo_url: Some(repository.html_url.clone()),
        ..overrides.clone()
    }
}

async fn apply_topics(client: &dyn RepoClient, repository: &Repository, topics: &[String]) -> BestEffort {
    if topics.is_empty() {
        return BestEffort::Skipped;
    }
    match client.set_topics(&repository.full_name, topics).await {
        Ok(()) => BestEffort::Applied,
        Err(e) => {
            tracing::warn!(repo = %repository.full_name, error = %e, "could not set topics");
            BestEffort::Failed(e.to_string())
        }
    }
}

/// Map a creation failure to a fatal job error with a user-facing hint.
async fn creation_failure(client: &dyn RepoClient, name: &str, error: GitHubError) -> ProvisionError {
    match error {
        GitHubError::Conflict(_) => ProvisionError::NameTaken {
            name: name.to_string(),
        },
        GitHubError::Unauthorized(_) => ProvisionError::CredentialRejected,
        GitHubError::Forbidden(message) => {
            let scopes = match client.scopes().await {
                Ok(scopes) if !scopes.is_empty() => scopes.join(", "),
                _ => "none".to_string(),
            };
            ProvisionError::MissingScope { scopes, message }
        }
        GitHubError::Validation(message) => ProvisionError::InvalidRequest(message),
        GitHubError::RateLimited { retry_after } => ProvisionError::RateLimited { retry_after },
        other => ProvisionError::Provider(other),
    }
}
