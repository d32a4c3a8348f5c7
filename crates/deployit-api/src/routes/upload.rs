//! Re-upload of an already packaged deployment, without rebuilding it.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use deployit_core::DeploymentId;
use deployit_core::deploy::FailedFile;
use deployit_deployer::{ArtifactUploader, NoopObserver};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/s3-upload", get(upload_info).post(upload))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    deployment_id: Option<String>,
    bucket_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    message: String,
    deployment_id: DeploymentId,
    total_files: usize,
    uploaded_count: usize,
    failed_count: usize,
    uploaded_files: Vec<String>,
    failed_files: Vec<FailedFile>,
    url: String,
    storage_path: String,
}

fn parse_deployment_id(raw: Option<&str>) -> Result<DeploymentId, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Deployment ID is required".to_string()))?;
    raw.parse()
        .map_err(|e: deployit_core::id::InvalidDeploymentId| ApiError::BadRequest(e.to_string()))
}

/// A bucket named in a request must be the one the store writes to.
fn check_bucket(state: &AppState, bucket: Option<&str>) -> Result<(), ApiError> {
    let Some(bucket) = bucket.map(str::trim).filter(|b| !b.is_empty()) else {
        return Ok(());
    };
    let location = state.object_store.location("");
    if location == format!("s3://{bucket}/") {
        return Ok(());
    }
    Err(ApiError::BadRequest(format!(
        "Bucket \"{bucket}\" is not configured (objects are stored at {location})"
    )))
}

/// Upload `<artifact_dir>/<deploymentId>` to the object store again.
///
/// Per-file failures are reported in `failedFiles`; the request itself
/// still succeeds.
async fn upload(
    State(state): State<AppState>,
    body: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let Json(request) =
        body.map_err(|e| ApiError::BadRequest(format!("Invalid JSON in request body: {e}")))?;
    let id = parse_deployment_id(request.deployment_id.as_deref())?;
    check_bucket(&state, request.bucket_name.as_deref())?;

    let artifact_path = state.artifact_dir.join(id.as_str());
    if !tokio::fs::metadata(&artifact_path)
        .await
        .is_ok_and(|m| m.is_dir())
    {
        return Err(ApiError::NotFound("Deployment not found".to_string()));
    }

    info!(deployment_id = %id, backend = state.object_store.name(), "Re-uploading deployment");
    let result = ArtifactUploader::new(state.object_store.clone())
        .upload(&id, &artifact_path, &NoopObserver, &CancellationToken::new())
        .await
        .map_err(|e| {
            error!(deployment_id = %id, error = %e, "Upload failed");
            ApiError::internal("Upload failed", e)
        })?;
    if !result.failed_files.is_empty() {
        warn!(
            deployment_id = %id,
            failed = result.failed_count(),
            total = result.total_files,
            "Some files failed to upload"
        );
    }

    Ok(Json(UploadResponse {
        success: true,
        message: "Files uploaded successfully".to_string(),
        failed_count: result.failed_count(),
        deployment_id: result.deployment_id,
        total_files: result.total_files,
        uploaded_count: result.uploaded_count,
        uploaded_files: result.uploaded_preview,
        failed_files: result.failed_files,
        url: result.object_store_url,
        storage_path: result.storage_path,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadQuery {
    deployment_id: Option<String>,
}

/// Where a deployment is published, or a liveness message without an id.
async fn upload_info(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.deployment_id.is_none() {
        return Ok(Json(serde_json::json!({
            "message": "Upload API is running",
            "endpoint": "/api/s3-upload",
        })));
    }
    let id = parse_deployment_id(query.deployment_id.as_deref())?;
    Ok(Json(serde_json::json!({
        "deploymentId": &id,
        "url": state.object_store.public_url(&format!("{id}/index.html")),
        "storagePath": state.object_store.location(&format!("{id}/")),
    })))
}
