use async_trait::async_trait;
use http::StatusCode;
use octocrab::Octocrab;
use runwatch_core::{
    GatewayError,
    models::{AnnotationLevel, CheckAnnotation, JobSnapshot, RunState, WorkflowRun},
};
use serde::Deserialize;
use time::OffsetDateTime;

/// The slice of the GitHub REST API the synchronization engine
/// consumes. Implementations must classify HTTP 401 as
/// [`GatewayError::Unauthorized`] so callers can stop polling a
/// rejected credential.
#[async_trait]
pub trait ActionsGateway: Send + Sync {
    /// List workflow runs for a repository, newest first.
    async fn list_runs(
        &self,
        repository: &str,
        page: u32,
        per_page: u8,
    ) -> Result<Vec<WorkflowRun>, GatewayError>;

    /// List the jobs of one workflow run.
    async fn list_jobs(
        &self,
        repository: &str,
        run_id: u64,
    ) -> Result<Vec<JobSnapshot>, GatewayError>;

    /// List the check-run annotations of one job. Notice-level
    /// annotations are dropped; only failures and warnings surface.
    async fn list_annotations(
        &self,
        repository: &str,
        job_id: u64,
    ) -> Result<Vec<CheckAnnotation>, GatewayError>;
}

#[derive(serde::Serialize)]
struct PageParams {
    per_page: u8,
    page: u32,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    workflow_runs: Vec<RunPayload>,
}

#[derive(Debug, Deserialize)]
struct RunPayload {
    id: u64,
    workflow_id: u64,
    head_branch: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    updated_at: Option<OffsetDateTime>,
    head_sha: Option<String>,
    display_title: Option<String>,
    html_url: Option<String>,
}

impl RunPayload {
    fn into_model(self) -> WorkflowRun {
        WorkflowRun {
            id: self.id,
            workflow_id: self.workflow_id,
            head_branch: self.head_branch.unwrap_or_default(),
            state: RunState::from_api(self.status.as_deref(), self.conclusion.as_deref()),
            created_at: self.created_at.map(OffsetDateTime::to_utc),
            updated_at: self.updated_at.map(OffsetDateTime::to_utc),
            head_sha: self.head_sha,
            display_title: self.display_title,
            html_url: self.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<JobPayload>,
}

#[derive(Debug, Deserialize)]
struct JobPayload {
    id: u64,
    name: String,
    status: Option<String>,
    conclusion: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    completed_at: Option<OffsetDateTime>,
    html_url: Option<String>,
}

impl JobPayload {
    fn into_model(self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name,
            state: RunState::from_api(self.status.as_deref(), self.conclusion.as_deref()),
            started_at: self.started_at.map(OffsetDateTime::to_utc),
            completed_at: self.completed_at.map(OffsetDateTime::to_utc),
            html_url: self.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnnotationPayload {
    path: Option<String>,
    start_line: Option<u32>,
    end_line: Option<u32>,
    start_column: Option<u32>,
    end_column: Option<u32>,
    annotation_level: Option<String>,
    message: Option<String>,
    title: Option<String>,
}

impl AnnotationPayload {
    fn into_model(self, job_id: u64) -> Option<CheckAnnotation> {
        let level = AnnotationLevel::from_api(self.annotation_level.as_deref()?)?;
        Some(CheckAnnotation {
            job_id,
            level,
            message: self.message.unwrap_or_default(),
            title: self.title.filter(|t| !t.is_empty()),
            path: self.path.unwrap_or_default(),
            start_line: self.start_line.unwrap_or(0),
            end_line: self.end_line.or(self.start_line).unwrap_or(0),
            start_column: self.start_column,
            end_column: self.end_column,
        })
    }
}

/// Octocrab-backed gateway authenticated with a personal token.
#[derive(Clone)]
pub struct GitHubGateway {
    client: Octocrab,
}

impl GitHubGateway {
    /// Build a client for the given token and verify it by fetching
    /// the authenticated user.
    pub async fn new(token: String) -> Result<Self, GatewayError> {
        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| GatewayError::Transport(Box::new(e)))?;
        let profile = client.current().user().await.map_err(classify)?;
        tracing::info!("Logged in as {}", profile.login);
        Ok(Self { client })
    }

    /// Wrap an existing client without validating the credential.
    pub fn from_client(client: Octocrab) -> Self { Self { client } }
}

#[async_trait]
impl ActionsGateway for GitHubGateway {
    async fn list_runs(
        &self,
        repository: &str,
        page: u32,
        per_page: u8,
    ) -> Result<Vec<WorkflowRun>, GatewayError> {
        let response: RunsPage = self
            .client
            .get(
                format!("/repos/{repository}/actions/runs"),
                Some(&PageParams { per_page, page }),
            )
            .await
            .map_err(classify)?;
        tracing::debug!("{repository} runs page {page}: {} entries", response.workflow_runs.len());
        Ok(response.workflow_runs.into_iter().map(RunPayload::into_model).collect())
    }

    async fn list_jobs(
        &self,
        repository: &str,
        run_id: u64,
    ) -> Result<Vec<JobSnapshot>, GatewayError> {
        let response: JobsPage = self
            .client
            .get(
                format!("/repos/{repository}/actions/runs/{run_id}/jobs"),
                Some(&PageParams { per_page: 100, page: 1 }),
            )
            .await
            .map_err(classify)?;
        Ok(response.jobs.into_iter().map(JobPayload::into_model).collect())
    }

    async fn list_annotations(
        &self,
        repository: &str,
        job_id: u64,
    ) -> Result<Vec<CheckAnnotation>, GatewayError> {
        // Job IDs double as check-run IDs.
        let response: Vec<AnnotationPayload> = self
            .client
            .get(
                format!("/repos/{repository}/check-runs/{job_id}/annotations"),
                Some(&PageParams { per_page: 100, page: 1 }),
            )
            .await
            .map_err(classify)?;
        Ok(response.into_iter().filter_map(|a| a.into_model(job_id)).collect())
    }
}

/// Map octocrab's error surface onto the engine's taxonomy.
fn classify(err: octocrab::Error) -> GatewayError {
    match err {
        octocrab::Error::GitHub { source, .. } => classify_status(source.status_code),
        octocrab::Error::Serde { source, .. } => GatewayError::Decode(source.to_string()),
        octocrab::Error::Json { source, .. } => GatewayError::Decode(source.to_string()),
        other => GatewayError::Transport(Box::new(other)),
    }
}

/// 401 gets its own variant so callers can stop polling a rejected
/// credential; any other refusal is reported with its status.
fn classify_status(status: StatusCode) -> GatewayError {
    if status == StatusCode::UNAUTHORIZED {
        GatewayError::Unauthorized
    } else {
        GatewayError::Http(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_page_maps_into_model() {
        let page: RunsPage = serde_json::from_str(
            r#"{
                "total_count": 2,
                "workflow_runs": [
                    {
                        "id": 99,
                        "workflow_id": 7,
                        "head_branch": "main",
                        "status": "completed",
                        "conclusion": "success",
                        "created_at": "2024-05-01T10:00:00Z",
                        "updated_at": "2024-05-01T10:05:00Z",
                        "head_sha": "abc123",
                        "display_title": "Fix the widget",
                        "html_url": "https://github.com/a/b/actions/runs/99"
                    },
                    {
                        "id": 98,
                        "workflow_id": 7,
                        "head_branch": null,
                        "status": "in_progress",
                        "conclusion": null
                    }
                ]
            }"#,
        )
        .unwrap();
        let runs: Vec<WorkflowRun> =
            page.workflow_runs.into_iter().map(RunPayload::into_model).collect();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, 99);
        assert_eq!(runs[0].state, RunState::Success);
        assert_eq!(runs[0].head_branch, "main");
        assert_eq!(runs[0].display_title.as_deref(), Some("Fix the widget"));
        assert!(runs[0].created_at.is_some());
        assert_eq!(runs[1].state, RunState::InProgress);
        assert_eq!(runs[1].head_branch, "");
        assert!(runs[1].created_at.is_none());
    }

    #[test]
    fn jobs_page_maps_into_model() {
        let page: JobsPage = serde_json::from_str(
            r#"{
                "total_count": 1,
                "jobs": [
                    {
                        "id": 501,
                        "name": "build",
                        "status": "completed",
                        "conclusion": "failure",
                        "started_at": "2024-05-01T10:00:10Z",
                        "completed_at": "2024-05-01T10:04:00Z",
                        "html_url": "https://github.com/a/b/actions/runs/99/job/501"
                    }
                ]
            }"#,
        )
        .unwrap();
        let jobs: Vec<JobSnapshot> = page.jobs.into_iter().map(JobPayload::into_model).collect();
        assert_eq!(jobs[0].id, 501);
        assert_eq!(jobs[0].name, "build");
        assert_eq!(jobs[0].state, RunState::Failure);
    }

    #[test]
    fn unauthorized_status_maps_to_its_own_variant() {
        assert!(classify_status(StatusCode::UNAUTHORIZED).is_unauthorized());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            GatewayError::Http(StatusCode::FORBIDDEN)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            GatewayError::Http(StatusCode::NOT_FOUND)
        ));
    }

    #[test]
    fn notice_annotations_are_dropped() {
        let payloads: Vec<AnnotationPayload> = serde_json::from_str(
            r#"[
                {
                    "path": "src/lib.rs",
                    "start_line": 10,
                    "end_line": 12,
                    "annotation_level": "warning",
                    "message": "unused variable",
                    "title": "clippy"
                },
                {
                    "path": "src/lib.rs",
                    "start_line": 1,
                    "end_line": 1,
                    "annotation_level": "notice",
                    "message": "informational"
                }
            ]"#,
        )
        .unwrap();
        let annotations: Vec<CheckAnnotation> =
            payloads.into_iter().filter_map(|a| a.into_model(501)).collect();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].job_id, 501);
        assert_eq!(annotations[0].level, AnnotationLevel::Warning);
        assert_eq!(annotations[0].start_line, 10);
        assert_eq!(annotations[0].end_line, 12);
    }
}
