//! Template set loading and placeholder substitution.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use launchpad_common::{ProjectConfig, TemplateFile};
use regex::Regex;
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Extensions whose files are copied byte-for-byte.
const BINARY_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".ico", ".woff", ".woff2", ".ttf",
];

const ENV_TEMPLATE_NAME: &str = ".env.local.template";
const ENV_OUTPUT_NAME: &str = ".env.local";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Z0-9_]+)\}\}").expect("valid placeholder regex"));

/// Renders the files under one template root for a project.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    root: PathBuf,
}

impl TemplateRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load every template file and substitute `config` into the text ones.
    ///
    /// Never fails: a missing root yields an empty set and unreadable files
    /// are skipped with a warning. Output is sorted by relative path.
    pub fn render(&self, config: &ProjectConfig) -> Vec<TemplateFile> {
        if !self.root.is_dir() {
            tracing::warn!(root = %self.root.display(), "template root not found, rendering nothing");
            return Vec::new();
        }

        let substitutions = config.substitutions();
        let mut files = Vec::new();

        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable template entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(relative) = relative_path(&self.root, entry.path()) else {
                continue;
            };
            let output_path = output_path(&relative);

            if is_binary_path(&relative) {
                match std::fs::read(entry.path()) {
                    Ok(bytes) => files.push(TemplateFile::binary(output_path, bytes)),
                    Err(e) => {
                        tracing::warn!(path = %relative, error = %e, "skipping unreadable template file");
                    }
                }
                continue;
            }

            match std::fs::read_to_string(entry.path()) {
                Ok(text) => {
                    let rendered = substitute(&text, &substitutions);
                    let unresolved = unresolved_placeholders(&rendered);
                    if !unresolved.is_empty() {
                        tracing::debug!(path = %output_path, ?unresolved, "placeholders left verbatim");
                    }
                    files.push(TemplateFile::text(output_path, rendered));
                }
                Err(e) => {
                    tracing::warn!(path = %relative, error = %e, "skipping unreadable template file");
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Forward-slash path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn output_path(relative: &str) -> String {
    match relative.rsplit_once('/') {
        Some((dir, ENV_TEMPLATE_NAME)) => format!("{}/{}", dir, ENV_OUTPUT_NAME),
        None if relative == ENV_TEMPLATE_NAME => ENV_OUTPUT_NAME.to_string(),
        _ => relative.to_string(),
    }
}

pub fn is_binary_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    BINARY_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Literal replacement of each `{{KEY}}` placeholder.
pub fn substitute(text: &str, substitutions: &[(String, &str)]) -> String {
    let mut out = text.to_string();
    for (placeholder, value) in substitutions {
        if out.contains(placeholder.as_str()) {
            out = out.replace(placeholder.as_str(), value);
        }
    }
    out
}

/// Placeholder keys still present in `text`, in order of first appearance.
pub fn unresolved_placeholders(text: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for cap in PLACEHOLDER_RE.captures_iter(text) {
        let key = cap[1].to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
