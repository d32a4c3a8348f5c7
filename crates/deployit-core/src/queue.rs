//! Durable job queue abstraction.
//!
//! A [`JobStore`] persists deployment jobs and arbitrates which worker owns
//! an attempt. Every mutation made on behalf of a running attempt carries the
//! [`Lease`] returned by [`JobStore::claim`]; stores reject it with
//! [`Error::LeaseLost`](crate::Error::LeaseLost) once another claim has
//! superseded it.

use async_trait::async_trait;
use std::time::Duration;

use crate::deploy::{DeploymentSpec, UploadResult};
use crate::job::{ClaimedJob, FailOutcome, JobOptions, JobRecord, Lease};
use crate::{JobId, Result};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Persist a new waiting job.
    async fn enqueue(&self, spec: DeploymentSpec, options: JobOptions) -> Result<JobId>;

    /// Claim the oldest claimable job for `worker_id`.
    ///
    /// Claimable means waiting with `run_at <= now`, or active with an expired
    /// lease (the previous owner stalled). Claiming starts a new attempt:
    /// progress resets to 0 and `attempts_made` is incremented.
    async fn claim(&self, worker_id: &str, lease_for: Duration) -> Result<Option<ClaimedJob>>;

    /// Push the lease expiry forward.
    async fn extend_lease(&self, lease: &Lease, lease_for: Duration) -> Result<()>;

    /// Raise the progress of the current attempt. Lower values are ignored.
    async fn update_progress(&self, lease: &Lease, progress: u8) -> Result<()>;

    /// Append one line to the job's log.
    async fn append_log(&self, lease: &Lease, line: &str) -> Result<()>;

    /// Mark the job completed with its result.
    async fn complete(&self, lease: &Lease, result: &UploadResult) -> Result<()>;

    /// Record a failed attempt; the store schedules a retry or fails the job.
    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome>;

    /// Hand an active job back without consuming the attempt.
    async fn release(&self, lease: &Lease) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    async fn logs(&self, job_id: JobId) -> Result<Option<Vec<String>>>;

    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Release backing connections. The store must not be used afterwards.
    async fn close(&self) {}
}
