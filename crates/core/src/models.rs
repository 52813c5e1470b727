use std::{collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::UtcDateTime;

/// Identifies one watched CI workflow: a repository, a workflow within
/// it, and the branch whose runs we care about. This is the map key
/// used everywhere in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedWorkflow {
    /// Full repository name, "owner/repo".
    pub repository: String,
    pub workflow_id: u64,
    pub branch: String,
}

impl WatchedWorkflow {
    pub fn new(
        repository: impl Into<String>,
        workflow_id: u64,
        branch: impl Into<String>,
    ) -> Self {
        Self { repository: repository.into(), workflow_id, branch: branch.into() }
    }

    pub fn owner(&self) -> &str {
        self.repository.split_once('/').map_or(self.repository.as_str(), |(owner, _)| owner)
    }

    pub fn repo_name(&self) -> &str {
        self.repository.split_once('/').map_or("", |(_, name)| name)
    }
}

impl fmt::Display for WatchedWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.repository, self.workflow_id, self.branch)
    }
}

/// Status of a workflow run or job, folding the API's separate
/// status/conclusion fields into one value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Waiting,
    InProgress,
    Success,
    Failure,
    Cancelled,
    Skipped,
    #[default]
    Unknown,
}

impl RunState {
    /// Fold an API (status, conclusion) pair into a single state.
    /// The conclusion is only meaningful once the status is "completed".
    pub fn from_api(status: Option<&str>, conclusion: Option<&str>) -> Self {
        match status {
            Some("queued" | "requested") => Self::Queued,
            Some("waiting" | "pending") => Self::Waiting,
            Some("in_progress") => Self::InProgress,
            Some("completed") => match conclusion {
                Some("success") => Self::Success,
                Some("failure" | "timed_out" | "startup_failure") => Self::Failure,
                Some("cancelled") => Self::Cancelled,
                Some("skipped") => Self::Skipped,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled | Self::Skipped)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RunState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "waiting" => Ok(Self::Waiting),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            "unknown" => Ok(Self::Unknown),
            _ => Err(()),
        }
    }
}

/// One run as returned by the "list workflow runs" endpoint, before
/// job/annotation enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRun {
    pub id: u64,
    pub workflow_id: u64,
    pub head_branch: String,
    pub state: RunState,
    pub created_at: Option<UtcDateTime>,
    pub updated_at: Option<UtcDateTime>,
    pub head_sha: Option<String>,
    pub display_title: Option<String>,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: u64,
    pub name: String,
    pub state: RunState,
    pub started_at: Option<UtcDateTime>,
    pub completed_at: Option<UtcDateTime>,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationLevel {
    Failure,
    Warning,
}

impl AnnotationLevel {
    pub fn from_api(level: &str) -> Option<Self> {
        match level {
            "failure" => Some(Self::Failure),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// A check-run annotation attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAnnotation {
    pub job_id: u64,
    pub level: AnnotationLevel,
    pub message: String,
    pub title: Option<String>,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub start_column: Option<u32>,
    pub end_column: Option<u32>,
}

impl CheckAnnotation {
    /// Identity used to collapse duplicates: the source location only,
    /// so the same diagnostic reported by multiple jobs appears once.
    pub fn location(&self) -> (&str, u32, u32, Option<u32>, Option<u32>) {
        (&self.path, self.start_line, self.end_line, self.start_column, self.end_column)
    }
}

/// Collapse duplicate annotations while preserving first-seen order.
pub fn dedup_annotations(annotations: Vec<CheckAnnotation>) -> Vec<CheckAnnotation> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(annotations.len());
    for annotation in annotations {
        let (path, start_line, end_line, start_column, end_column) = annotation.location();
        let key = (path.to_owned(), start_line, end_line, start_column, end_column);
        if seen.insert(key) {
            out.push(annotation);
        }
    }
    out
}

/// The enriched, comparable status of the most recent matching run for
/// one watched workflow. Full structural equality drives change
/// detection: consumers are only notified when a snapshot differs from
/// the previously cached one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub key: WatchedWorkflow,
    pub state: RunState,
    pub run_id: Option<u64>,
    pub created_at: Option<UtcDateTime>,
    pub updated_at: Option<UtcDateTime>,
    pub head_sha: Option<String>,
    pub commit_title: Option<String>,
    pub jobs: Vec<JobSnapshot>,
    pub annotations: Vec<CheckAnnotation>,
    pub html_url: Option<String>,
}

impl RunSnapshot {
    /// The snapshot for a workflow with no discovered run. Not an
    /// error: a workflow that never ran (or whose last run is too old
    /// to find) simply has nothing to report yet.
    pub fn unknown(key: WatchedWorkflow) -> Self {
        Self {
            key,
            state: RunState::Unknown,
            run_id: None,
            created_at: None,
            updated_at: None,
            head_sha: None,
            commit_title: None,
            jobs: Vec::new(),
            annotations: Vec::new(),
            html_url: None,
        }
    }

    pub fn from_run(key: WatchedWorkflow, run: &WorkflowRun) -> Self {
        Self {
            key,
            state: run.state,
            run_id: Some(run.id),
            created_at: run.created_at,
            updated_at: run.updated_at,
            head_sha: run.head_sha.clone(),
            commit_title: run.display_title.clone(),
            jobs: Vec::new(),
            annotations: Vec::new(),
            html_url: run.html_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_workflow_parses_full_name() {
        let key = WatchedWorkflow::new("octo/widget", 7, "main");
        assert_eq!(key.owner(), "octo");
        assert_eq!(key.repo_name(), "widget");
        assert_eq!(key.to_string(), "octo/widget#7@main");
    }

    #[test]
    fn run_state_folds_status_and_conclusion() {
        let cases: &[(Option<&str>, Option<&str>, RunState)] = &[
            (Some("queued"), None, RunState::Queued),
            (Some("waiting"), None, RunState::Waiting),
            (Some("in_progress"), None, RunState::InProgress),
            (Some("completed"), Some("success"), RunState::Success),
            (Some("completed"), Some("failure"), RunState::Failure),
            (Some("completed"), Some("timed_out"), RunState::Failure),
            (Some("completed"), Some("cancelled"), RunState::Cancelled),
            (Some("completed"), Some("skipped"), RunState::Skipped),
            (Some("completed"), Some("neutral"), RunState::Unknown),
            (Some("completed"), None, RunState::Unknown),
            (None, None, RunState::Unknown),
        ];
        for &(status, conclusion, expected) in cases {
            assert_eq!(RunState::from_api(status, conclusion), expected);
        }
    }

    #[test]
    fn run_state_round_trips_as_str() {
        for state in [
            RunState::Queued,
            RunState::Waiting,
            RunState::InProgress,
            RunState::Success,
            RunState::Failure,
            RunState::Cancelled,
            RunState::Skipped,
            RunState::Unknown,
        ] {
            assert_eq!(state.as_str().parse::<RunState>(), Ok(state));
        }
    }

    fn annotation(path: &str, start_line: u32, message: &str) -> CheckAnnotation {
        CheckAnnotation {
            job_id: 1,
            level: AnnotationLevel::Warning,
            message: message.to_string(),
            title: None,
            path: path.to_string(),
            start_line,
            end_line: start_line,
            start_column: None,
            end_column: None,
        }
    }

    #[test]
    fn duplicate_annotations_collapse_by_location() {
        let deduped = dedup_annotations(vec![
            annotation("src/lib.rs", 10, "first"),
            annotation("src/lib.rs", 10, "reported again by another job"),
            annotation("src/lib.rs", 20, "different line"),
            annotation("src/main.rs", 10, "different file"),
        ]);
        assert_eq!(deduped.len(), 3);
        // First occurrence wins, order preserved.
        assert_eq!(deduped[0].message, "first");
        assert_eq!(deduped[1].start_line, 20);
        assert_eq!(deduped[2].path, "src/main.rs");
    }

    #[test]
    fn unknown_snapshot_has_empty_detail() {
        let snapshot = RunSnapshot::unknown(WatchedWorkflow::new("a/b", 7, "main"));
        assert_eq!(snapshot.state, RunState::Unknown);
        assert!(snapshot.run_id.is_none());
        assert!(snapshot.created_at.is_none());
        assert!(snapshot.jobs.is_empty());
        assert!(snapshot.annotations.is_empty());
    }
}
