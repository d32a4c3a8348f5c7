//! Deployment submission and job polling endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use deployit_core::deploy::{DeployRequest, DeploymentSpec, UploadResult};
use deployit_core::job::JobState;
use deployit_core::{DeploymentId, Error, JobId};
use deployit_executor::workspace;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/deploy", get(deployment_info).post(submit))
        .route("/api/deploy/status", get(job_status))
        .route("/api/deploy/logs", get(job_logs))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    success: bool,
    deployment_id: DeploymentId,
    job_id: JobId,
    repo_name: String,
    branch: String,
    message: String,
    status_url: String,
    logs_url: String,
    timestamp: DateTime<Utc>,
}

async fn submit(
    State(state): State<AppState>,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(request) =
        body.map_err(|e| ApiError::BadRequest(format!("Invalid JSON in request body: {e}")))?;
    if request.repo_url.trim().is_empty() {
        return Err(ApiError::BadRequest("Repository URL is required".to_string()));
    }

    let submission = state.queue.submit(request).await.map_err(|e| match e {
        Error::Validation(msg) => ApiError::BadRequest(msg),
        other => {
            error!(error = %other, "Failed to enqueue deployment");
            ApiError::internal("Failed to create deployment job", other)
        }
    })?;

    let job_id = submission.job_id;
    let spec = submission.spec;
    info!(job_id = %job_id, deployment_id = %spec.deployment_id, "Deployment accepted");

    Ok(Json(SubmitResponse {
        success: true,
        deployment_id: spec.deployment_id,
        job_id,
        repo_name: spec.repo_name,
        branch: spec.branch,
        message: "Deployment job created. Build process will start shortly.".to_string(),
        status_url: format!("/api/deploy/status?jobId={job_id}"),
        logs_url: format!("/api/deploy/logs?jobId={job_id}"),
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobQuery {
    job_id: Option<String>,
}

impl JobQuery {
    fn parse(&self) -> Result<JobId, ApiError> {
        let raw = self
            .job_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Job ID is required".to_string()))?;
        raw.parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid job ID: {raw}")))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResponse {
    job_id: JobId,
    state: JobState,
    progress: u8,
    data: DeploymentSpec,
    logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<UploadResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_reason: Option<String>,
    attempts_made: u32,
    timestamp: DateTime<Utc>,
    processed_on: Option<DateTime<Utc>>,
    finished_on: Option<DateTime<Utc>>,
}

async fn job_status(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = query.parse()?;
    let record = state
        .queue
        .status(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;

    let result = match record.state {
        JobState::Completed => record.result,
        _ => None,
    };
    let failed_reason = match record.state {
        JobState::Failed => record.failed_reason,
        _ => None,
    };

    Ok(Json(JobStatusResponse {
        job_id: record.id,
        state: record.state,
        progress: record.progress,
        data: record.spec,
        logs: record.logs,
        result,
        failed_reason,
        attempts_made: record.attempts_made,
        timestamp: record.enqueued_at,
        processed_on: record.started_at,
        finished_on: record.finished_at,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobLogsResponse {
    job_id: JobId,
    logs: Vec<String>,
}

async fn job_logs(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobLogsResponse>, ApiError> {
    let job_id = query.parse()?;
    let logs = state
        .queue
        .logs(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;
    Ok(Json(JobLogsResponse { job_id, logs }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentQuery {
    deployment_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentInfo {
    success: bool,
    deployment_id: String,
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl DeploymentInfo {
    fn missing(deployment_id: String) -> Self {
        Self {
            success: false,
            deployment_id,
            exists: false,
            path: None,
            modified: None,
            files_count: None,
            url: None,
            message: Some("Deployment not found".to_string()),
        }
    }
}

/// Whether a deployment's local artifact directory exists, and where it is
/// published.
async fn deployment_info(
    State(state): State<AppState>,
    Query(query): Query<DeploymentQuery>,
) -> Result<Json<DeploymentInfo>, ApiError> {
    let raw = query
        .deployment_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Deployment ID is required".to_string()))?;
    let id: DeploymentId = raw
        .parse()
        .map_err(|e: deployit_core::id::InvalidDeploymentId| ApiError::BadRequest(e.to_string()))?;

    let path = state.artifact_dir.join(id.as_str());
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_dir() => m,
        _ => return Ok(Json(DeploymentInfo::missing(id.to_string()))),
    };

    let files = workspace::list_files(&path)
        .await
        .map_err(|e| ApiError::internal("Failed to check deployment status", e))?;

    Ok(Json(DeploymentInfo {
        success: true,
        url: Some(state.object_store.public_url(&format!("{id}/index.html"))),
        deployment_id: id.to_string(),
        exists: true,
        path: Some(path.display().to_string()),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        files_count: Some(files.len()),
        message: None,
    }))
}
