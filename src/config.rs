//! Service configuration for Launchpad.
//!
//! Settings are layered: built-in defaults, then an optional `launchpad.toml`,
//! then environment variables (a `.env` file is loaded first), then CLI flags
//! applied by the binary.
//!
//! # Configuration File Format
//!
//! ```toml
//! project_name = "Launchpad API"
//! api_prefix = "/api/v1"
//! port = 8000
//! cors_origins = ["http://localhost:3000"]
//! template_dir = "templates/nextjs-supabase"
//!
//! [rate_limit]
//! default_limit = 100
//! default_period_secs = 60
//! auth_limit = 20
//! auth_period_secs = 60
//!
//! [provisioning]
//! batch_size = 10
//! batch_pause_ms = 1000
//! progress_every = 5
//! topics = ["nextjs", "supabase", "typescript"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "launchpad.toml";

/// Sliding-window admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub default_limit: usize,
    pub default_period_secs: u64,
    /// Applied to routes under `{api_prefix}/auth`.
    pub auth_limit: usize,
    pub auth_period_secs: u64,
    pub sweep_interval_secs: u64,
    /// Clients whose newest request is older than this are forgotten.
    pub idle_ttl_secs: u64,
    /// Key clients by the first `X-Forwarded-For` hop instead of the peer address.
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_period_secs: 60,
            auth_limit: 20,
            auth_period_secs: 60,
            sweep_interval_secs: 300,
            idle_ttl_secs: 3600,
            trust_forwarded_for: false,
        }
    }
}

/// Provisioning job tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    /// Emit `upload_progress` every N files (and always on the last one).
    pub progress_every: usize,
    pub default_branch: String,
    pub commit_message: String,
    pub topics: Vec<String>,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause_ms: 1000,
            progress_every: 5,
            default_branch: "main".to_string(),
            commit_message: "Initial commit from Launchpad".to_string(),
            topics: vec![
                "nextjs".to_string(),
                "supabase".to_string(),
                "typescript".to_string(),
            ],
        }
    }
}

impl ProvisioningSettings {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

/// Fully resolved service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub project_name: String,
    pub api_prefix: String,
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub jwt_secret: Option<String>,
    pub jwt_algorithm: String,
    pub jwt_audience: Option<String>,
    pub github_api_url: String,
    pub template_dir: PathBuf,
    /// Base URL of the managed database (PostgREST-style).
    pub store_url: Option<String>,
    pub store_key: Option<String>,
    pub rate_limit: RateLimitSettings,
    pub provisioning: ProvisioningSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: "Launchpad API".to_string(),
            api_prefix: "/api/v1".to_string(),
            environment: "development".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
            jwt_secret: None,
            jwt_algorithm: "HS256".to_string(),
            jwt_audience: None,
            github_api_url: "https://api.github.com".to_string(),
            template_dir: PathBuf::from("templates/nextjs-supabase"),
            store_url: None,
            store_key: None,
            rate_limit: RateLimitSettings::default(),
            provisioning: ProvisioningSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse settings from a TOML string. Missing keys keep their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse launchpad.toml")
    }

    /// Load `path` if given, otherwise `launchpad.toml` when present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Resolve settings for the running process: file layer, then `.env` and
    /// the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal outside development.
        let _ = dotenvy::dotenv();
        let mut settings = Self::load_or_default(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("PROJECT_NAME") {
            self.project_name = v;
        }
        if let Some(v) = var("API_V1_STR") {
            self.api_prefix = v;
        }
        if let Some(v) = var("ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = var("HOST") {
            self.host = v;
        }
        if let Some(v) = var("PORT") {
            self.port = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT '{}'", v))?;
        }
        if let Some(v) = var("CORS_ORIGINS") {
            self.cors_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("JWT_SECRET_KEY") {
            self.jwt_secret = Some(v);
        }
        if let Some(v) = var("JWT_ALGORITHM") {
            self.jwt_algorithm = v;
        }
        if let Some(v) = var("JWT_AUDIENCE") {
            self.jwt_audience = Some(v);
        }
        if let Some(v) = var("GITHUB_API_URL") {
            self.github_api_url = v;
        }
        if let Some(v) = var("TEMPLATE_DIR") {
            self.template_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SUPABASE_URL") {
            self.store_url = Some(v);
        }
        if let Some(v) = var("SUPABASE_SERVICE_ROLE_KEY").or_else(|| var("SUPABASE_ANON_KEY")) {
            self.store_key = Some(v);
        }
        Ok(())
    }

    /// Path prefix of the authentication routes that get the strict window.
    pub fn auth_prefix(&self) -> String {
        format!("{}/auth", self.api_prefix.trim_end_matches('/'))
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.jwt_secret.as_deref().is_none_or(str::is_empty) {
            problems.push("JWT_SECRET_KEY must be set".to_string());
        }
        if !self.api_prefix.starts_with('/') {
            problems.push(format!("api_prefix '{}' must start with '/'", self.api_prefix));
        }
        if self.rate_limit.default_limit == 0 || self.rate_limit.auth_limit == 0 {
            problems.push("rate limits must be greater than zero".to_string());
        }
        if self.rate_limit.default_period_secs == 0 || self.rate_limit.auth_period_secs == 0 {
            problems.push("rate limit periods must be greater than zero".to_string());
        }
        if self.provisioning.batch_size == 0 {
            problems.push("provisioning.batch_size must be greater than zero".to_string());
        }
        if self.provisioning.progress_every == 0 {
            problems.push("provisioning.progress_every must be greater than zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("Invalid configuration: {}", problems.join("; "))
        }
    }
}
