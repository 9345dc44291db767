use serde::{Deserialize, Serialize};

/// Phase of a provisioning job.
///
/// On the success path every phase is entered exactly once, in declaration
/// order. `Error` is absorbing and is only reachable while the repository
/// does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Accepted,
    RepoCreated,
    TemplatePrepared,
    InitialCommit,
    Uploading,
    TopicsSet,
    Complete,
    Error,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RepoCreated => "repo_created",
            Self::TemplatePrepared => "template_prepared",
            Self::InitialCommit => "initial_commit",
            Self::Uploading => "uploading",
            Self::TopicsSet => "topics_set",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Whether a job in `self` may move to `next`.
    pub fn can_advance_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Accepted, RepoCreated)
                | (Accepted, Error)
                | (RepoCreated, TemplatePrepared)
                | (TemplatePrepared, InitialCommit)
                | (InitialCommit, Uploading)
                | (Uploading, TopicsSet)
                | (TopicsSet, Complete)
        )
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path_is_linear() {
        let path = [
            JobPhase::Accepted,
            JobPhase::RepoCreated,
            JobPhase::TemplatePrepared,
            JobPhase::InitialCommit,
            JobPhase::Uploading,
            JobPhase::TopicsSet,
            JobPhase::Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_only_before_repository_exists() {
        assert!(JobPhase::Accepted.can_advance_to(JobPhase::Error));
        assert!(!JobPhase::RepoCreated.can_advance_to(JobPhase::Error));
        assert!(!JobPhase::Uploading.can_advance_to(JobPhase::Error));
    }

    #[test]
    fn test_no_skipping_phases() {
        assert!(!JobPhase::Accepted.can_advance_to(JobPhase::Uploading));
        assert!(!JobPhase::Uploading.can_advance_to(JobPhase::Complete));
        assert!(!JobPhase::Complete.can_advance_to(JobPhase::Accepted));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(JobPhase::Complete.is_terminal());
        assert!(JobPhase::Error.is_terminal());
        assert!(!JobPhase::Uploading.is_terminal());
    }
}
