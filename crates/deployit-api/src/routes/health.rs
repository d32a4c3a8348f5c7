//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if let Err(e) = state.queue.ping().await {
        warn!(error = %e, "Readiness check failed");
        return Err(ApiError::Unavailable(format!("job queue unavailable: {e}")));
    }
    Ok(Json(json!({
        "status": "ready",
        "queue": state.queue.store().name(),
    })))
}
