use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame type the browser client listens for on the live channel.
pub const PROJECT_UPDATE: &str = "project_update";

// ── Progress events ──────────────────────────────────────────────────

/// A milestone of one provisioning job, in publish order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update_type", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    RepositoryCreated {
        name: String,
        full_name: String,
        html_url: String,
    },
    PreparingTemplate {
        message: String,
    },
    TemplateReady {
        total_files: usize,
    },
    UploadStarted {
        total_files: usize,
    },
    UploadProgress {
        current: usize,
        total: usize,
        percentage: u8,
    },
    FileError {
        path: String,
        error: String,
    },
    UploadComplete {
        total_files: usize,
        uploaded: usize,
        failed: usize,
        repo_url: String,
    },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RepositoryCreated { .. } => "repository_created",
            Self::PreparingTemplate { .. } => "preparing_template",
            Self::TemplateReady { .. } => "template_ready",
            Self::UploadStarted { .. } => "upload_started",
            Self::UploadProgress { .. } => "upload_progress",
            Self::FileError { .. } => "file_error",
            Self::UploadComplete { .. } => "upload_complete",
        }
    }

    /// Build an `UploadProgress` event; percentage is rounded down.
    pub fn upload_progress(current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            (current.min(total) * 100 / total) as u8
        };
        Self::UploadProgress {
            current,
            total,
            percentage,
        }
    }
}

// ── Wire frame ───────────────────────────────────────────────────────

/// Envelope pushed to live connections:
/// `{"type":"project_update","update_type":..,"data":{..},"timestamp":..}`.
#[derive(Debug, Serialize)]
pub struct ProgressFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    #[serde(flatten)]
    pub event: &'a ProgressEvent,
    pub timestamp: DateTime<Utc>,
}

impl<'a> ProgressFrame<'a> {
    pub fn new(event: &'a ProgressEvent) -> Self {
        Self {
            frame_type: PROJECT_UPDATE,
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_matches_client_wire_format() {
        let event = ProgressEvent::TemplateReady { total_files: 12 };
        let json = ProgressFrame::new(&event).to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "project_update");
        assert_eq!(parsed["update_type"], "template_ready");
        assert_eq!(parsed["data"]["total_files"], 12);
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = vec![
            ProgressEvent::RepositoryCreated {
                name: "demo".into(),
                full_name: "octo/demo".into(),
                html_url: "https://github.com/octo/demo".into(),
            },
            ProgressEvent::PreparingTemplate {
                message: "Preparing".into(),
            },
            ProgressEvent::UploadStarted { total_files: 3 },
            ProgressEvent::upload_progress(1, 3),
            ProgressEvent::FileError {
                path: "a.txt".into(),
                error: "boom".into(),
            },
            ProgressEvent::UploadComplete {
                total_files: 3,
                uploaded: 2,
                failed: 1,
                repo_url: "https://github.com/octo/demo".into(),
            },
        ];
        for event in events {
            let parsed: serde_json::Value = serde_json::to_value(&event).unwrap();
            assert_eq!(parsed["update_type"], event.kind());
        }
    }

    #[test]
    fn test_upload_progress_percentage() {
        match ProgressEvent::upload_progress(5, 20) {
            ProgressEvent::UploadProgress { percentage, .. } => assert_eq!(percentage, 25),
            _ => panic!("Expected UploadProgress"),
        }
        match ProgressEvent::upload_progress(20, 20) {
            ProgressEvent::UploadProgress { percentage, .. } => assert_eq!(percentage, 100),
            _ => panic!("Expected UploadProgress"),
        }
        match ProgressEvent::upload_progress(0, 0) {
            ProgressEvent::UploadProgress { percentage, .. } => assert_eq!(percentage, 100),
            _ => panic!("Expected UploadProgress"),
        }
    }

    #[test]
    fn test_file_error_roundtrip() {
        let event = ProgressEvent::FileError {
            path: "src/app/page.tsx".into(),
            error: "GitHub API error (status 502)".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
