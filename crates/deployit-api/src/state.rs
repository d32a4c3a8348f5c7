//! Application state.

use deployit_core::artifact::ObjectStore;
use deployit_scheduler::DeployQueue;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub queue: DeployQueue,
    /// Used to build public URLs of finished deployments.
    pub object_store: Arc<dyn ObjectStore>,
    /// Where workers leave packaged artifacts.
    pub artifact_dir: PathBuf,
}

impl AppState {
    pub fn new(
        queue: DeployQueue,
        object_store: Arc<dyn ObjectStore>,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            object_store,
            artifact_dir: artifact_dir.into(),
        }
    }
}
