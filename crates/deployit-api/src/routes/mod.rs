//! API routes.

pub mod deploy;
pub mod health;
pub mod upload;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(deploy::router())
        .merge(health::router())
        .merge(upload::router())
        .with_state(state)
}
