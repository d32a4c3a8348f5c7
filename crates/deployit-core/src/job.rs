//! Queued deployment jobs and queue options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::JobId;
use crate::deploy::{DeploymentSpec, UploadResult};

/// Upper bound for a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 3600);

/// Failure reason recorded for a job whose last attempt stopped heartbeating.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// State of a job as seen by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker, possibly delayed by a retry backoff.
    Waiting,
    /// Held by a worker for the current attempt.
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Exponential retry backoff: `initial_delay * multiplier^(attempt - 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn exponential(initial_delay: Duration) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            multiplier: 2.0,
        }
    }

    /// Delay before retrying after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        if !millis.is_finite() || millis >= MAX_BACKOFF.as_millis() as f64 {
            return MAX_BACKOFF;
        }
        Duration::from_millis(millis as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(5000))
    }
}

/// How many finished jobs the queue keeps around for pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many completed jobs.
    pub max_completed: Option<u64>,
    /// Keep at most this many failed jobs.
    pub max_failed: Option<u64>,
    /// Evict finished jobs older than this many seconds.
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_completed: Some(100),
            max_failed: Some(50),
            max_age_secs: Some(24 * 3600),
        }
    }
}

/// Per-job queue options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// A job as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub spec: DeploymentSpec,
    pub state: JobState,
    pub progress: u8,
    pub logs: Vec<String>,
    /// Attempts counted against `max_attempts`. A release gives one back.
    pub attempts_made: u32,
    /// Executions started, released ones included. Never decreases.
    #[serde(default)]
    pub runs: u32,
    pub options: JobOptions,
    pub result: Option<UploadResult>,
    pub failed_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a waiting job may be claimed.
    pub run_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, spec: DeploymentSpec, options: JobOptions, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            state: JobState::Waiting,
            progress: 0,
            logs: Vec::new(),
            attempts_made: 0,
            runs: 0,
            options,
            result: None,
            failed_reason: None,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            run_at: now,
        }
    }
}

/// Exclusivity token for one attempt of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub token: Uuid,
    pub worker_id: String,
    /// 1-based attempt number this lease was issued for.
    pub attempt: u32,
    /// 1-based execution number; differs from `attempt` once a job was released.
    pub run: u32,
}

impl Lease {
    pub fn new(job_id: JobId, worker_id: impl Into<String>, attempt: u32, run: u32) -> Self {
        Self {
            job_id,
            token: Uuid::new_v4(),
            worker_id: worker_id.into(),
            attempt,
            run,
        }
    }

    /// Tag prefixed to every log line written under this lease.
    pub fn log_tag(&self) -> String {
        if self.run == self.attempt {
            format!("[attempt {}]", self.attempt)
        } else {
            format!("[attempt {}, run {}]", self.attempt, self.run)
        }
    }
}

/// A job claimed by a worker together with its lease.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub record: JobRecord,
    pub lease: Lease,
}

/// What the queue did with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job goes back to waiting and becomes claimable after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// All attempts are used up.
    Failed { attempts: u32 },
}

/// Decide what happens after attempt `attempt` failed.
pub fn next_after_failure(options: &JobOptions, attempt: u32) -> FailOutcome {
    if attempt < options.max_attempts {
        FailOutcome::Retrying {
            attempt,
            delay: options.backoff.delay_for(attempt),
        }
    } else {
        FailOutcome::Failed { attempts: attempt }
    }
}
