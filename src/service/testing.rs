//! In-memory GitHub double shared by the provisioner and API tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::github::{
    CommitRef, FileWrite, GitHubUser, NewRepository, RepoClient, RepoClientFactory, Repository,
};
use crate::errors::GitHubError;

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub content: Vec<u8>,
    pub sha: String,
}

pub struct MockRepoClient {
    pub login: String,
    scopes: Mutex<Vec<String>>,
    pub repos: Mutex<BTreeMap<String, Repository>>,
    pub files: Mutex<HashMap<(String, String), StoredFile>>,
    pub topics: Mutex<HashMap<String, Vec<String>>>,
    failing_paths: Mutex<HashSet<String>>,
    fail_topics: AtomicBool,
    forbid_create: AtomicBool,
    next_id: AtomicUsize,
    pub put_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MockRepoClient {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            scopes: Mutex::new(vec!["repo".to_string()]),
            repos: Mutex::new(BTreeMap::new()),
            files: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            failing_paths: Mutex::new(HashSet::new()),
            fail_topics: AtomicBool::new(false),
            forbid_create: AtomicBool::new(false),
            next_id: AtomicUsize::new(1),
            put_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_scopes(self, scopes: &[&str]) -> Self {
        *self.scopes.lock().unwrap() = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_repo(self, name: &str) -> Self {
        let repo = self.repository(name, None, false);
        self.repos.lock().unwrap().insert(repo.full_name.clone(), repo);
        self
    }

    pub fn failing_path(self, path: &str) -> Self {
        self.failing_paths.lock().unwrap().insert(path.to_string());
        self
    }

    pub fn failing_topics(self) -> Self {
        self.fail_topics.store(true, Ordering::SeqCst);
        self
    }

    pub fn forbidding_create(self) -> Self {
        self.forbid_create.store(true, Ordering::SeqCst);
        self
    }

    pub fn file(&self, full_name: &str, path: &str) -> Option<StoredFile> {
        self.files
            .lock()
            .unwrap()
            .get(&(full_name.to_string(), path.to_string()))
            .cloned()
    }

    pub fn has_repo(&self, full_name: &str) -> bool {
        self.repos.lock().unwrap().contains_key(full_name)
    }

    fn repository(&self, name: &str, description: Option<String>, private: bool) -> Repository {
        let full_name = format!("{}/{}", self.login, name);
        Repository {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
            name: name.to_string(),
            html_url: format!("https://github.com/{}", full_name),
            clone_url: format!("https://github.com/{}.git", full_name),
            ssh_url: format!("git@github.com:{}.git", full_name),
            full_name,
            private,
            description,
        }
    }
}

#[async_trait]
impl RepoClient for MockRepoClient {
    async fn current_user(&self) -> Result<GitHubUser, GitHubError> {
        Ok(GitHubUser {
            login: self.login.clone(),
            id: 1,
            name: Some("Octo Cat".to_string()),
            email: None,
            public_repos: self.repos.lock().unwrap().len() as u64,
            owned_private_repos: Some(0),
        })
    }

    async fn scopes(&self) -> Result<Vec<String>, GitHubError> {
        Ok(self.scopes.lock().unwrap().clone())
    }

    async fn create_repository(&self, repo: &NewRepository) -> Result<Repository, GitHubError> {
        if self.forbid_create.load(Ordering::SeqCst) {
            return Err(GitHubError::Forbidden("Resource not accessible by integration".into()));
        }
        let created = self.repository(&repo.name, repo.description.clone(), repo.private);
        let mut repos = self.repos.lock().unwrap();
        if repos.contains_key(&created.full_name) {
            return Err(GitHubError::Conflict(
                "Repository creation failed.: name already exists on this account".into(),
            ));
        }
        repos.insert(created.full_name.clone(), created.clone());
        Ok(created)
    }

    async fn list_repositories(&self, limit: usize) -> Result<Vec<Repository>, GitHubError> {
        Ok(self
            .repos
            .lock()
            .unwrap()
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository, GitHubError> {
        self.repos
            .lock()
            .unwrap()
            .get(&format!("{}/{}", owner, name))
            .cloned()
            .ok_or_else(|| GitHubError::NotFound("Not Found".into()))
    }

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<(), GitHubError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let has_delete_scope = self.scopes.lock().unwrap().iter().any(|s| s == "delete_repo");
        if !has_delete_scope {
            return Err(GitHubError::Forbidden("Must have admin rights to Repository.".into()));
        }
        self.repos
            .lock()
            .unwrap()
            .remove(&format!("{}/{}", owner, name))
            .map(|_| ())
            .ok_or_else(|| GitHubError::NotFound("Not Found".into()))
    }

    async fn file_sha(
        &self,
        full_name: &str,
        path: &str,
        _branch: &str,
    ) -> Result<Option<String>, GitHubError> {
        Ok(self.file(full_name, path).map(|f| f.sha))
    }

    async fn put_file(
        &self,
        full_name: &str,
        file: &FileWrite<'_>,
        sha: Option<&str>,
    ) -> Result<CommitRef, GitHubError> {
        let n = self.put_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_paths.lock().unwrap().contains(file.path) {
            return Err(GitHubError::Status {
                status: 500,
                message: format!("failed to write {}", file.path),
            });
        }

        let key = (full_name.to_string(), file.path.to_string());
        let mut files = self.files.lock().unwrap();
        match (files.get(&key), sha) {
            (Some(_), None) => {
                return Err(GitHubError::Conflict("\"sha\" wasn't supplied.".into()));
            }
            (Some(existing), Some(sha)) if existing.sha != sha => {
                return Err(GitHubError::Conflict(format!("is at {} but expected {}", existing.sha, sha)));
            }
            _ => {}
        }
        let new_sha = format!("sha{}", n);
        files.insert(
            key,
            StoredFile {
                content: file.content.to_vec(),
                sha: new_sha.clone(),
            },
        );
        Ok(CommitRef {
            commit_sha: format!("commit{}", n),
            content_sha: Some(new_sha),
        })
    }

    async fn set_topics(&self, full_name: &str, topics: &[String]) -> Result<(), GitHubError> {
        if self.fail_topics.load(Ordering::SeqCst) {
            return Err(GitHubError::Validation("Invalid topic".into()));
        }
        self.topics
            .lock()
            .unwrap()
            .insert(full_name.to_string(), topics.to_vec());
        Ok(())
    }
}

/// Hands out the same mock regardless of token.
pub struct MockClientFactory {
    pub client: Arc<MockRepoClient>,
}

impl RepoClientFactory for MockClientFactory {
    fn for_token(&self, _token: &str) -> Arc<dyn RepoClient> {
        self.client.clone()
    }
}
