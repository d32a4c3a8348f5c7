//! Deployment queue client.

use deployit_config::{QueueBackend, QueueConfig};
use deployit_core::deploy::{DeployRequest, DeploymentSpec};
use deployit_core::job::{JobOptions, JobRecord};
use deployit_core::queue::JobStore;
use deployit_core::{JobId, Result};
use deployit_db::PgJobStore;
use std::sync::Arc;
use tracing::info;

use crate::memory::MemoryJobStore;

/// An accepted submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: JobId,
    pub spec: DeploymentSpec,
}

/// Client for submitting deployments and polling their jobs.
///
/// Built explicitly from configuration and passed to whoever needs it; the
/// HTTP server and the worker each hold one.
#[derive(Clone)]
pub struct DeployQueue {
    store: Arc<dyn JobStore>,
    defaults: JobOptions,
}

impl DeployQueue {
    pub fn new(store: Arc<dyn JobStore>, defaults: JobOptions) -> Self {
        Self { store, defaults }
    }

    /// Open the backing store selected by `config`.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let store: Arc<dyn JobStore> = match config.backend {
            QueueBackend::Memory => Arc::new(MemoryJobStore::new()),
            QueueBackend::Postgres => Arc::new(
                PgJobStore::connect(&config.database_url, config.max_connections).await?,
            ),
        };
        info!(backend = store.name(), "Job queue connected");
        Ok(Self::new(store, config.job_options()))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    /// Validate a request and enqueue it with the default options.
    pub async fn submit(&self, request: DeployRequest) -> Result<Submission> {
        let spec = request.into_spec()?;
        self.submit_spec(spec, self.defaults.clone()).await
    }

    /// Enqueue an already validated spec.
    pub async fn submit_spec(
        &self,
        spec: DeploymentSpec,
        options: JobOptions,
    ) -> Result<Submission> {
        let job_id = self.store.enqueue(spec.clone(), options).await?;
        info!(
            job_id = %job_id,
            deployment_id = %spec.deployment_id,
            repo = %spec.repo_name,
            branch = %spec.branch,
            "Deployment submitted"
        );
        Ok(Submission { job_id, spec })
    }

    pub async fn status(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.store.get(job_id).await
    }

    pub async fn logs(&self, job_id: JobId) -> Result<Option<Vec<String>>> {
        self.store.logs(job_id).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub async fn close(&self) {
        self.store.close().await;
        info!("Job queue closed");
    }
}
