//! HTTP tests for the deployment endpoints, backed by the in-memory queue.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use deployit_api::{AppState, routes};
use deployit_core::job::{JobOptions, JobState};
use deployit_core::queue::JobStore;
use deployit_core::JobId;
use deployit_deployer::LocalObjectStore;
use deployit_scheduler::{DeployQueue, MemoryJobStore};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Arc<MemoryJobStore>,
    artifacts: TempDir,
}

fn app() -> TestApp {
    let store = Arc::new(MemoryJobStore::new());
    let artifacts = tempfile::tempdir().unwrap();
    let state = AppState::new(
        DeployQueue::new(store.clone(), JobOptions::default()),
        Arc::new(LocalObjectStore::new(
            artifacts.path().join("published"),
            Some("https://sites.example.com".to_string()),
        )),
        artifacts.path(),
    );
    TestApp {
        router: routes::router(state),
        store,
        artifacts,
    }
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(router: &Router, uri: &str) -> Response<Body> {
    router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(router: &Router, uri: &str, body: Value) -> Response<Body> {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn health_endpoints() {
    let app = app();
    let response = get(&app.router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = get(&app.router, "/health/ready").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ready");
    assert_eq!(json["queue"], "memory");
}

#[tokio::test]
async fn submit_returns_job_and_urls() {
    let app = app();
    let response = post_json(
        &app.router,
        "/api/deploy",
        json!({ "repoUrl": "https://github.com/acme/site", "branch": "develop" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["repoName"], "repository");
    assert_eq!(json["branch"], "develop");
    assert_eq!(json["deploymentId"].as_str().unwrap().len(), 32);

    let job_id = json["jobId"].as_str().unwrap();
    assert_eq!(
        json["statusUrl"],
        format!("/api/deploy/status?jobId={job_id}")
    );
    assert_eq!(json["logsUrl"], format!("/api/deploy/logs?jobId={job_id}"));

    let record = app
        .store
        .get(job_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.spec.branch, "develop");
}

#[tokio::test]
async fn submit_rejects_invalid_requests() {
    let app = app();

    let response = post_json(&app.router, "/api/deploy", json!({})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Repository URL is required");

    let response = post_json(
        &app.router,
        "/api/deploy",
        json!({ "repoUrl": "ftp://example.com/repo" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());

    let response = post_json(
        &app.router,
        "/api/deploy",
        json!({ "repoUrl": "https://github.com/acme/site", "buildPath": "../etc" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/deploy")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(app.store.is_empty().await);
}

#[tokio::test]
async fn status_and_logs_follow_the_job() {
    let app = app();
    let json = body_json(
        post_json(
            &app.router,
            "/api/deploy",
            json!({ "repoUrl": "git@github.com:acme/site.git", "repoName": "site" }),
        )
        .await,
    )
    .await;
    let job_id = json["jobId"].as_str().unwrap().to_string();

    let status = body_json(get(&app.router, &format!("/api/deploy/status?jobId={job_id}")).await).await;
    assert_eq!(status["state"], "waiting");
    assert_eq!(status["progress"], 0);
    assert_eq!(status["data"]["repoName"], "site");
    assert_eq!(status["attemptsMade"], 0);
    assert!(status.get("result").is_none());
    assert!(status.get("failedReason").is_none());

    let job = app
        .store
        .claim("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    app.store.update_progress(&job.lease, 15).await.unwrap();
    app.store
        .append_log(&job.lease, "[attempt 1] Repository cloned")
        .await
        .unwrap();

    let status = body_json(get(&app.router, &format!("/api/deploy/status?jobId={job_id}")).await).await;
    assert_eq!(status["state"], "active");
    assert_eq!(status["progress"], 15);
    assert_eq!(status["attemptsMade"], 1);
    assert!(status["processedOn"].is_string());

    let logs = body_json(get(&app.router, &format!("/api/deploy/logs?jobId={job_id}")).await).await;
    assert_eq!(logs["jobId"], job_id.as_str());
    assert_eq!(logs["logs"], json!(["[attempt 1] Repository cloned"]));
}

#[tokio::test]
async fn status_requires_a_known_job() {
    let app = app();

    let response = get(&app.router, "/api/deploy/status").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Job ID is required");

    let response = get(&app.router, "/api/deploy/status?jobId=nope").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&app.router, &format!("/api/deploy/logs?jobId={}", JobId::new())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "Job not found");
}

#[tokio::test]
async fn deployment_info_reports_artifacts() {
    let app = app();
    let id = "0123456789abcdef0123456789abcdef";

    let json = body_json(get(&app.router, &format!("/api/deploy?deploymentId={id}")).await).await;
    assert_eq!(json["exists"], false);
    assert_eq!(json["success"], false);

    let dir = app.artifacts.path().join(id);
    std::fs::create_dir_all(dir.join("assets")).unwrap();
    std::fs::write(dir.join("index.html"), "<html></html>").unwrap();
    std::fs::write(dir.join("assets/app.js"), "").unwrap();

    let json = body_json(get(&app.router, &format!("/api/deploy?deploymentId={id}")).await).await;
    assert_eq!(json["exists"], true);
    assert_eq!(json["filesCount"], 2);
    assert_eq!(
        json["url"],
        format!("https://sites.example.com/{id}/index.html")
    );

    let response = get(&app.router, "/api/deploy?deploymentId=../../etc").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = get(&app.router, "/api/deploy").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_republishes_packaged_deployment() {
    let app = app();
    let id = "0123456789abcdef0123456789abcdef";

    let response = post_json(&app.router, "/api/s3-upload", json!({ "deploymentId": id })).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let dir = app.artifacts.path().join(id);
    std::fs::create_dir_all(dir.join("css")).unwrap();
    std::fs::write(dir.join("index.html"), "<html></html>").unwrap();
    std::fs::write(dir.join("css/site.css"), "body {}").unwrap();

    let response = post_json(&app.router, "/api/s3-upload", json!({ "deploymentId": id })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["deploymentId"], id);
    assert_eq!(json["totalFiles"], 2);
    assert_eq!(json["uploadedCount"], 2);
    assert_eq!(json["failedCount"], 0);
    assert_eq!(json["failedFiles"], json!([]));
    assert_eq!(json["url"], format!("https://sites.example.com/{id}/index.html"));

    let published = app.artifacts.path().join("published").join(id);
    assert_eq!(
        std::fs::read_to_string(published.join("css/site.css")).unwrap(),
        "body {}"
    );
    assert!(published.join("index.html").exists());
}

#[tokio::test]
async fn upload_validates_request() {
    let app = app();

    let response = post_json(&app.router, "/api/s3-upload", json!({})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Deployment ID is required");

    let response = post_json(&app.router, "/api/s3-upload", json!({ "deploymentId": "../etc" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The local backend has no bucket to name.
    let id = "0123456789abcdef0123456789abcdef";
    std::fs::create_dir_all(app.artifacts.path().join(id)).unwrap();
    let response = post_json(
        &app.router,
        "/api/s3-upload",
        json!({ "deploymentId": id, "bucketName": "elsewhere" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_info_reports_public_url() {
    let app = app();
    let id = "0123456789abcdef0123456789abcdef";

    let json = body_json(get(&app.router, &format!("/api/s3-upload?deploymentId={id}")).await).await;
    assert_eq!(json["deploymentId"], id);
    assert_eq!(json["url"], format!("https://sites.example.com/{id}/index.html"));

    let json = body_json(get(&app.router, "/api/s3-upload").await).await;
    assert_eq!(json["endpoint"], "/api/s3-upload");
}
