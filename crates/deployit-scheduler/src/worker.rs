//! Worker that claims deployment jobs and runs them through the pipeline.

use crate::orchestrator::{DeployPipeline, JobContext};
use deployit_config::WorkerConfig;
use deployit_core::job::{ClaimedJob, FailOutcome, Lease};
use deployit_core::pipeline::StageError;
use deployit_core::queue::JobStore;
use deployit_core::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before polling again after the store returned an error.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub shutdown_grace: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            lease_duration: config.lease_duration(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// A worker that claims and executes jobs, up to `concurrency` at a time.
pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    pipeline: Arc<DeployPipeline>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        pipeline: Arc<DeployPipeline>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            pipeline,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `shutdown` fires.
    ///
    /// On shutdown the worker stops claiming and gives running jobs the grace
    /// period to finish. Jobs still running afterwards are cancelled, which
    /// kills their child processes and releases them back to the queue.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.id,
            concurrency = self.settings.concurrency,
            "Starting worker"
        );

        let slots = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let jobs_cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.store.claim(&self.id, self.settings.lease_duration).await {
                Ok(Some(job)) => {
                    info!(
                        worker_id = %self.id,
                        job_id = %job.lease.job_id,
                        attempt = job.lease.attempt,
                        deployment_id = %job.record.spec.deployment_id,
                        "Claimed job"
                    );
                    let store = self.store.clone();
                    let pipeline = self.pipeline.clone();
                    let lease_for = self.settings.lease_duration;
                    let cancel = jobs_cancel.child_token();
                    tasks.spawn(async move {
                        process_job(store, pipeline, job, lease_for, cancel).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(CLAIM_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(
                worker_id = %self.id,
                running = tasks.len(),
                grace_secs = self.settings.shutdown_grace.as_secs(),
                "Waiting for running jobs"
            );
            let drained =
                tokio::time::timeout(self.settings.shutdown_grace, drain(&mut tasks)).await;
            if drained.is_err() {
                warn!(
                    worker_id = %self.id,
                    running = tasks.len(),
                    "Grace period elapsed, cancelling running jobs"
                );
                jobs_cancel.cancel();
                drain(&mut tasks).await;
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Job task panicked");
    }
}

/// Run one attempt and report its outcome to the store.
pub async fn process_job(
    store: Arc<dyn JobStore>,
    pipeline: Arc<DeployPipeline>,
    job: ClaimedJob,
    lease_for: Duration,
    cancel: CancellationToken,
) {
    let ClaimedJob { record, lease } = job;
    let ctx = JobContext::new(store.clone(), lease.clone());

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat(
        store.clone(),
        ctx.clone(),
        lease_for,
        cancel.clone(),
        heartbeat_stop.clone(),
    ));

    let outcome = pipeline.run(&record.spec, &ctx, &cancel).await;

    heartbeat_stop.cancel();
    if let Err(e) = heartbeat.await {
        error!(job_id = %lease.job_id, error = %e, "Heartbeat task panicked");
    }

    if ctx.lease_lost() {
        warn!(job_id = %lease.job_id, "Lease lost during attempt, outcome discarded");
        return;
    }

    match outcome {
        Ok(result) => match store.complete(&lease, &result).await {
            Ok(()) => info!(
                job_id = %lease.job_id,
                uploaded = result.uploaded_count,
                failed = result.failed_count(),
                url = %result.object_store_url,
                "Job completed"
            ),
            Err(e) => report_store_error(&lease, "complete", e),
        },
        Err(StageError::Queue(Error::LeaseLost(_))) => {
            warn!(job_id = %lease.job_id, "Lease lost during attempt, outcome discarded");
        }
        Err(StageError::Cancelled) => match store.release(&lease).await {
            Ok(()) => info!(job_id = %lease.job_id, "Job released back to the queue"),
            Err(e) => report_store_error(&lease, "release", e),
        },
        Err(err) => match store.fail(&lease, &err.to_string()).await {
            Ok(FailOutcome::Retrying { attempt, delay }) => info!(
                job_id = %lease.job_id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Attempt failed, retry scheduled"
            ),
            Ok(FailOutcome::Failed { attempts }) => warn!(
                job_id = %lease.job_id,
                attempts,
                reason = %err,
                "Job failed"
            ),
            Err(e) => report_store_error(&lease, "fail", e),
        },
    }
}

fn report_store_error(lease: &Lease, action: &str, err: Error) {
    match err {
        Error::LeaseLost(_) => {
            warn!(job_id = %lease.job_id, action, "Lease lost before the outcome was recorded")
        }
        other => error!(job_id = %lease.job_id, action, error = %other, "Failed to record job outcome"),
    }
}

/// Extend the lease every third of its duration until `stop` fires. A lost
/// lease cancels the attempt.
async fn heartbeat(
    store: Arc<dyn JobStore>,
    ctx: JobContext,
    lease_for: Duration,
    attempt: CancellationToken,
    stop: CancellationToken,
) {
    let lease = ctx.lease();
    let interval = (lease_for / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(interval) => {}
        }
        match store.extend_lease(lease, lease_for).await {
            Ok(()) => debug!(job_id = %lease.job_id, "Lease extended"),
            Err(Error::LeaseLost(_)) => {
                warn!(job_id = %lease.job_id, "Lease lost, cancelling attempt");
                ctx.mark_lease_lost();
                attempt.cancel();
                return;
            }
            Err(e) => warn!(job_id = %lease.job_id, error = %e, "Failed to extend lease"),
        }
    }
}
