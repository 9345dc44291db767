use serde::{Deserialize, Serialize};

/// A named placeholder that template files may reference as `{{KEY}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateVariable {
    ProjectName,
    ProjectDescription,
    GithubUsername,
    GithubRepoUrl,
    SupabaseUrl,
    SupabaseAnonKey,
    SupabaseServiceRoleKey,
    SupabaseProjectId,
}

impl TemplateVariable {
    pub const ALL: [TemplateVariable; 8] = [
        Self::ProjectName,
        Self::ProjectDescription,
        Self::GithubUsername,
        Self::GithubRepoUrl,
        Self::SupabaseUrl,
        Self::SupabaseAnonKey,
        Self::SupabaseServiceRoleKey,
        Self::SupabaseProjectId,
    ];

    /// The placeholder key as written between the braces.
    pub fn key(self) -> &'static str {
        match self {
            Self::ProjectName => "PROJECT_NAME",
            Self::ProjectDescription => "PROJECT_DESCRIPTION",
            Self::GithubUsername => "GITHUB_USERNAME",
            Self::GithubRepoUrl => "GITHUB_REPO_URL",
            Self::SupabaseUrl => "SUPABASE_URL",
            Self::SupabaseAnonKey => "SUPABASE_ANON_KEY",
            Self::SupabaseServiceRoleKey => "SUPABASE_SERVICE_ROLE_KEY",
            Self::SupabaseProjectId => "SUPABASE_PROJECT_ID",
        }
    }

    /// Value rendered when the project configuration leaves the field unset.
    pub fn default_value(self) -> &'static str {
        match self {
            Self::ProjectName => "my-app",
            Self::ProjectDescription => "A Next.js app with Supabase",
            Self::GithubUsername => "",
            Self::GithubRepoUrl => "",
            Self::SupabaseUrl => "your_supabase_url",
            Self::SupabaseAnonKey => "your_supabase_anon_key",
            Self::SupabaseServiceRoleKey => "your_supabase_service_key",
            Self::SupabaseProjectId => "your_project_id",
        }
    }

    pub fn placeholder(self) -> String {
        format!("{{{{{}}}}}", self.key())
    }
}

/// Variables substituted into a template set for one provisioning request.
///
/// Built once per request and only ever read afterwards; the renderer takes
/// it by shared reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub github_username: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
    #[serde(default)]
    pub supabase_service_key: Option<String>,
    #[serde(default)]
    pub supabase_project_id: Option<String>,
}

impl ProjectConfig {
    fn field(&self, var: TemplateVariable) -> Option<&str> {
        let value = match var {
            TemplateVariable::ProjectName => &self.name,
            TemplateVariable::ProjectDescription => &self.description,
            TemplateVariable::GithubUsername => &self.github_username,
            TemplateVariable::GithubRepoUrl => &self.repo_url,
            TemplateVariable::SupabaseUrl => &self.supabase_url,
            TemplateVariable::SupabaseAnonKey => &self.supabase_anon_key,
            TemplateVariable::SupabaseServiceRoleKey => &self.supabase_service_key,
            TemplateVariable::SupabaseProjectId => &self.supabase_project_id,
        };
        value.as_deref()
    }

    /// Resolved value for `var`, falling back to its default when unset.
    pub fn value(&self, var: TemplateVariable) -> &str {
        self.field(var).unwrap_or_else(|| var.default_value())
    }

    /// All `(placeholder, value)` pairs in a fixed order.
    pub fn substitutions(&self) -> Vec<(String, &str)> {
        TemplateVariable::ALL
            .iter()
            .map(|var| (var.placeholder(), self.value(*var)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_wraps_key_in_double_braces() {
        assert_eq!(TemplateVariable::ProjectName.placeholder(), "{{PROJECT_NAME}}");
    }

    #[test]
    fn test_unset_fields_fall_back_to_defaults() {
        let config = ProjectConfig::default();
        assert_eq!(config.value(TemplateVariable::ProjectName), "my-app");
        assert_eq!(config.value(TemplateVariable::GithubUsername), "");
        assert_eq!(
            config.value(TemplateVariable::SupabaseAnonKey),
            "your_supabase_anon_key"
        );
    }

    #[test]
    fn test_set_fields_override_defaults() {
        let config = ProjectConfig {
            name: Some("demo".into()),
            supabase_project_id: Some("abc123".into()),
            ..Default::default()
        };
        assert_eq!(config.value(TemplateVariable::ProjectName), "demo");
        assert_eq!(config.value(TemplateVariable::SupabaseProjectId), "abc123");
    }

    #[test]
    fn test_substitutions_cover_every_variable() {
        let config = ProjectConfig::default();
        let subs = config.substitutions();
        assert_eq!(subs.len(), TemplateVariable::ALL.len());
        assert!(subs.iter().any(|(k, _)| k == "{{SUPABASE_SERVICE_ROLE_KEY}}"));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ProjectConfig =
            serde_json::from_str(r#"{"name": "demo", "repo_url": "https://github.com/o/demo"}"#)
                .unwrap();
        assert_eq!(config.name.as_deref(), Some("demo"));
        assert!(config.description.is_none());
    }
}
