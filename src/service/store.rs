//! Provisioned-project records.
//!
//! `RestProjectStore` talks to a PostgREST endpoint (the managed database's
//! `/rest/v1` API) with the service key. `InMemoryProjectStore` backs tests
//! and local runs without a database.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StoreError;

const TABLE: &str = "projects";

fn default_template_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// A stored project row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub github_repo_url: String,
    pub github_repo_id: u64,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub has_supabase_db: bool,
    #[serde(default)]
    pub auth_providers: Vec<String>,
    #[serde(default)]
    pub has_stripe: bool,
    #[serde(default)]
    pub vercel_deployed: bool,
    #[serde(default)]
    pub vercel_deployment_url: Option<String>,
    #[serde(default)]
    pub github_topics: Vec<String>,
    #[serde(default = "default_template_version")]
    pub template_version: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_github_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl ProjectRecord {
    fn repo_path(&self) -> &str {
        let url = self.github_repo_url.trim_end_matches('/');
        url.strip_prefix("https://github.com/").unwrap_or(url)
    }

    /// `owner/name` taken from the last two segments of the repository URL.
    pub fn full_name(&self) -> String {
        let parts: Vec<&str> = self.github_repo_url.trim_end_matches('/').split('/').collect();
        match parts.as_slice() {
            [.., owner, name] if !owner.is_empty() && !name.is_empty() => {
                format!("{}/{}", owner, name)
            }
            _ => self.name.clone(),
        }
    }

    pub fn clone_url(&self) -> String {
        format!("{}.git", self.github_repo_url.trim_end_matches('/'))
    }

    pub fn ssh_url(&self) -> String {
        format!("git@github.com:{}.git", self.repo_path())
    }

    fn apply(&mut self, update: &ProjectUpdate) {
        if let Some(v) = &update.description {
            self.description = Some(v.clone());
        }
        if let Some(v) = update.has_supabase_db {
            self.has_supabase_db = v;
        }
        if let Some(v) = &update.auth_providers {
            self.auth_providers = v.clone();
        }
        if let Some(v) = update.has_stripe {
            self.has_stripe = v;
        }
        if let Some(v) = update.vercel_deployed {
            self.vercel_deployed = v;
        }
        if let Some(v) = &update.vercel_deployment_url {
            self.vercel_deployment_url = Some(v.clone());
        }
        if let Some(v) = &update.github_topics {
            self.github_topics = v.clone();
        }
        if let Some(v) = update.is_active {
            self.is_active = v;
        }
        self.updated_at = Utc::now();
    }
}

/// Row inserted after a successful provisioning job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub github_repo_url: String,
    pub github_repo_id: u64,
    pub is_private: bool,
    pub github_topics: Vec<String>,
    pub template_version: String,
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_supabase_db: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_providers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_stripe: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vercel_deployed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vercel_deployment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Active projects of `user_id`, newest first.
    async fn list_active(&self, user_id: &str) -> Result<Vec<ProjectRecord>, StoreError>;

    async fn get(&self, user_id: &str, id: &str) -> Result<ProjectRecord, StoreError>;

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        update: &ProjectUpdate,
    ) -> Result<ProjectRecord, StoreError>;

    async fn insert(&self, project: &NewProject) -> Result<ProjectRecord, StoreError>;

    /// Cheap reachability check for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

// ── PostgREST ────────────────────────────────────────────────────────

pub struct RestProjectStore {
    http: reqwest::Client,
    base_url: String,
    key: String,
}

impl RestProjectStore {
    pub fn new(url: &str, key: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            key: key.into(),
        })
    }

    fn request(&self, method: Method) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, TABLE))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn rows(&self, req: reqwest::RequestBuilder) -> Result<Vec<ProjectRecord>, StoreError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    fn first(rows: Vec<ProjectRecord>, id: &str) -> Result<ProjectRecord, StoreError> {
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::ProjectNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl ProjectStore for RestProjectStore {
    async fn list_active(&self, user_id: &str) -> Result<Vec<ProjectRecord>, StoreError> {
        let user = format!("eq.{}", user_id);
        let req = self.request(Method::GET).query(&[
            ("select", "*"),
            ("user_id", user.as_str()),
            ("is_active", "eq.true"),
            ("order", "created_at.desc"),
        ]);
        self.rows(req).await
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<ProjectRecord, StoreError> {
        let user = format!("eq.{}", user_id);
        let pid = format!("eq.{}", id);
        let req = self.request(Method::GET).query(&[
            ("select", "*"),
            ("id", pid.as_str()),
            ("user_id", user.as_str()),
        ]);
        Self::first(self.rows(req).await?, id)
    }

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        update: &ProjectUpdate,
    ) -> Result<ProjectRecord, StoreError> {
        let user = format!("eq.{}", user_id);
        let pid = format!("eq.{}", id);
        let mut body = serde_json::to_value(update).unwrap_or_else(|_| serde_json::json!({}));
        body["updated_at"] = serde_json::Value::String(Utc::now().to_rfc3339());
        let req = self
            .request(Method::PATCH)
            .query(&[("id", pid.as_str()), ("user_id", user.as_str())])
            .header("Prefer", "return=representation")
            .json(&body);
        Self::first(self.rows(req).await?, id)
    }

    async fn insert(&self, project: &NewProject) -> Result<ProjectRecord, StoreError> {
        let req = self
            .request(Method::POST)
            .header("Prefer", "return=representation")
            .json(project);
        Self::first(self.rows(req).await?, &project.name)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let req = self
            .request(Method::GET)
            .query(&[("select", "id"), ("limit", "1")]);
        let resp = req.send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Status {
                status: resp.status().as_u16(),
                message: "projects table unreachable".to_string(),
            })
        }
    }
}

// ── In-memory ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryProjectStore {
    rows: Mutex<Vec<ProjectRecord>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, Vec<ProjectRecord>> {
        self.rows.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn list_active(&self, user_id: &str) -> Result<Vec<ProjectRecord>, StoreError> {
        let mut projects: Vec<ProjectRecord> = self
            .rows()
            .iter()
            .filter(|p| p.user_id == user_id && p.is_active)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<ProjectRecord, StoreError> {
        self.rows()
            .iter()
            .find(|p| p.id == id && p.user_id == user_id)
            .cloned()
            .ok_or_else(|| StoreError::ProjectNotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        update: &ProjectUpdate,
    ) -> Result<ProjectRecord, StoreError> {
        let mut rows = self.rows();
        let project = rows
            .iter_mut()
            .find(|p| p.id == id && p.user_id == user_id)
            .ok_or_else(|| StoreError::ProjectNotFound { id: id.to_string() })?;
        project.apply(update);
        Ok(project.clone())
    }

    async fn insert(&self, project: &NewProject) -> Result<ProjectRecord, StoreError> {
        let now = Utc::now();
        let record = ProjectRecord {
            id: Uuid::new_v4().to_string(),
            user_id: project.user_id.clone(),
            name: project.name.clone(),
            description: project.description.clone(),
            github_repo_url: project.github_repo_url.clone(),
            github_repo_id: project.github_repo_id,
            is_private: project.is_private,
            has_supabase_db: false,
            auth_providers: Vec::new(),
            has_stripe: false,
            vercel_deployed: false,
            vercel_deployment_url: None,
            github_topics: project.github_topics.clone(),
            template_version: project.template_version.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_github_sync: None,
            deployed_at: None,
        };
        self.rows().push(record.clone());
        Ok(record)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
