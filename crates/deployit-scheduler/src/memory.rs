//! In-process job store.
//!
//! Holds every job in a map behind one lock. Used for local development,
//! single-process deployments and tests; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployit_core::deploy::{DeploymentSpec, UploadResult};
use deployit_core::job::{
    ClaimedJob, FailOutcome, JobOptions, JobRecord, JobState, Lease, RetentionPolicy,
    STALLED_REASON, next_after_failure,
};
use deployit_core::queue::JobStore;
use deployit_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
struct ActiveLease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    lease: Option<ActiveLease>,
}

impl Entry {
    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.record.state == JobState::Active
            && self.lease.as_ref().is_none_or(|l| l.expires_at < now)
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.record.state {
            JobState::Waiting => self.record.run_at <= now,
            JobState::Active => self.lease_expired(now),
            _ => false,
        }
    }
}

/// `now + delay`, saturating instead of overflowing.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Job store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Entry>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently held, finished ones included.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Run `f` on the entry owned by `lease`.
    async fn with_lease<T>(
        &self,
        lease: &Lease,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&lease.job_id) {
            Some(entry)
                if entry.record.state == JobState::Active
                    && entry.lease.as_ref().is_some_and(|l| l.token == lease.token) =>
            {
                Ok(f(entry))
            }
            _ => {
                debug!(job_id = %lease.job_id, worker = %lease.worker_id, "Lease no longer held");
                Err(Error::LeaseLost(lease.job_id))
            }
        }
    }
}

/// Evict finished jobs beyond the retention thresholds.
fn apply_retention(
    jobs: &mut HashMap<JobId, Entry>,
    state: JobState,
    retention: &RetentionPolicy,
    now: DateTime<Utc>,
) {
    let keep = match state {
        JobState::Completed => retention.max_completed,
        JobState::Failed => retention.max_failed,
        _ => None,
    };

    let mut evict = Vec::new();
    if let Some(keep) = keep {
        let mut finished: Vec<_> = jobs
            .values()
            .filter(|e| e.record.state == state)
            .map(|e| (e.record.finished_at, e.record.id))
            .collect();
        // Newest first.
        finished.sort_by(|a, b| b.cmp(a));
        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
        evict.extend(finished.into_iter().skip(keep).map(|(_, id)| id));
    }

    let cutoff = retention
        .max_age_secs
        .and_then(|secs| chrono::Duration::try_seconds(i64::try_from(secs).ok()?))
        .and_then(|age| now.checked_sub_signed(age));
    if let Some(cutoff) = cutoff {
        evict.extend(
            jobs.values()
                .filter(|e| e.record.state.is_terminal())
                .filter(|e| e.record.finished_at.is_some_and(|at| at < cutoff))
                .map(|e| e.record.id),
        );
    }

    for id in evict {
        if jobs.remove(&id).is_some() {
            debug!(job_id = %id, "Evicted finished job");
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, spec: DeploymentSpec, options: JobOptions) -> Result<JobId> {
        let id = JobId::new();
        let deployment_id = spec.deployment_id.clone();
        let record = JobRecord::new(id, spec, options, Utc::now());
        self.jobs
            .lock()
            .await
            .insert(id, Entry { record, lease: None });

        info!(job_id = %id, deployment_id = %deployment_id, "Enqueued job");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease_for: Duration) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut stalled = Vec::new();
        for entry in jobs.values_mut() {
            let exhausted = entry.record.attempts_made >= entry.record.options.max_attempts;
            if exhausted && entry.lease_expired(now) {
                entry.record.state = JobState::Failed;
                entry.record.failed_reason = Some(STALLED_REASON.to_string());
                entry.record.finished_at = Some(now);
                entry.lease = None;
                stalled.push(entry.record.options.retention.clone());
            }
        }
        if !stalled.is_empty() {
            warn!(count = stalled.len(), "Failed jobs that stalled on their last attempt");
            for retention in stalled {
                apply_retention(&mut jobs, JobState::Failed, &retention, now);
            }
        }

        let next = jobs
            .values()
            .filter(|e| e.claimable(now))
            .min_by_key(|e| (e.record.run_at, e.record.enqueued_at, e.record.id))
            .map(|e| e.record.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        entry.record.state = JobState::Active;
        entry.record.attempts_made += 1;
        entry.record.runs += 1;
        entry.record.progress = 0;
        entry.record.started_at = Some(now);

        let lease = Lease::new(id, worker_id, entry.record.attempts_made, entry.record.runs);
        entry.lease = Some(ActiveLease {
            token: lease.token,
            expires_at: after(now, lease_for),
        });

        info!(job_id = %id, worker = %worker_id, attempt = lease.attempt, "Claimed job");
        Ok(Some(ClaimedJob {
            record: entry.record.clone(),
            lease,
        }))
    }

    async fn extend_lease(&self, lease: &Lease, lease_for: Duration) -> Result<()> {
        let expires_at = after(Utc::now(), lease_for);
        self.with_lease(lease, |entry| {
            if let Some(active) = entry.lease.as_mut() {
                active.expires_at = expires_at;
            }
        })
        .await
    }

    async fn update_progress(&self, lease: &Lease, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        self.with_lease(lease, |entry| {
            entry.record.progress = entry.record.progress.max(progress);
        })
        .await
    }

    async fn append_log(&self, lease: &Lease, line: &str) -> Result<()> {
        self.with_lease(lease, |entry| entry.record.logs.push(line.to_string()))
            .await
    }

    async fn complete(&self, lease: &Lease, result: &UploadResult) -> Result<()> {
        let now = Utc::now();
        let retention = self
            .with_lease(lease, |entry| {
                entry.record.state = JobState::Completed;
                entry.record.progress = 100;
                entry.record.result = Some(result.clone());
                entry.record.failed_reason = None;
                entry.record.finished_at = Some(now);
                entry.lease = None;
                entry.record.options.retention.clone()
            })
            .await?;

        apply_retention(&mut *self.jobs.lock().await, JobState::Completed, &retention, now);
        info!(job_id = %lease.job_id, "Job completed");
        Ok(())
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome> {
        let now = Utc::now();
        let (outcome, retention) = self
            .with_lease(lease, |entry| {
                let outcome = next_after_failure(&entry.record.options, entry.record.attempts_made);
                entry.lease = None;
                match &outcome {
                    FailOutcome::Retrying { delay, .. } => {
                        entry.record.state = JobState::Waiting;
                        entry.record.run_at = after(now, *delay);
                    }
                    FailOutcome::Failed { .. } => {
                        entry.record.state = JobState::Failed;
                        entry.record.failed_reason = Some(reason.to_string());
                        entry.record.finished_at = Some(now);
                    }
                }
                (outcome, entry.record.options.retention.clone())
            })
            .await?;

        match &outcome {
            FailOutcome::Retrying { attempt, delay } => {
                info!(job_id = %lease.job_id, attempt, delay_ms = delay.as_millis() as u64, "Job will be retried");
            }
            FailOutcome::Failed { attempts } => {
                apply_retention(&mut *self.jobs.lock().await, JobState::Failed, &retention, now);
                warn!(job_id = %lease.job_id, attempts, reason, "Job failed");
            }
        }
        Ok(outcome)
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let now = Utc::now();
        self.with_lease(lease, |entry| {
            entry.record.state = JobState::Waiting;
            entry.record.attempts_made = entry.record.attempts_made.saturating_sub(1);
            entry.record.run_at = now;
            entry.lease = None;
        })
        .await?;

        info!(job_id = %lease.job_id, "Released job back to the queue");
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|e| e.record.clone()))
    }

    async fn logs(&self, job_id: JobId) -> Result<Option<Vec<String>>> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|e| e.record.logs.clone()))
    }
}
