//! Job queue implementation using PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployit_core::deploy::{DeploymentSpec, UploadResult};
use deployit_core::job::{
    ClaimedJob, FailOutcome, JobOptions, JobRecord, JobState, Lease, RetentionPolicy,
    STALLED_REASON, next_after_failure,
};
use deployit_core::queue::JobStore;
use deployit_core::{Error, JobId, Result};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DbError, DbResult, create_pool, run_migrations};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    spec: Json<DeploymentSpec>,
    state: String,
    progress: i16,
    attempts_made: i32,
    runs: i32,
    options: Json<JobOptions>,
    result: Option<Json<UploadResult>>,
    failed_reason: Option<String>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    run_at: DateTime<Utc>,
}

impl JobRow {
    fn into_record(self, logs: Vec<String>) -> DbResult<JobRecord> {
        let state = self
            .state
            .parse::<JobState>()
            .map_err(|message| DbError::Corrupt {
                id: self.id,
                message,
            })?;
        Ok(JobRecord {
            id: JobId::from_uuid(self.id),
            spec: self.spec.0,
            state,
            progress: self.progress.clamp(0, 100) as u8,
            logs,
            attempts_made: self.attempts_made.max(0) as u32,
            runs: self.runs.max(0) as u32,
            options: self.options.0,
            result: self.result.map(|r| r.0),
            failed_reason: self.failed_reason,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            run_at: self.run_at,
        })
    }
}

fn db(err: sqlx::Error) -> Error {
    DbError::from(err).into()
}

fn held(rows_affected: u64, lease: &Lease) -> Result<()> {
    if rows_affected == 0 {
        debug!(job_id = %lease.job_id, worker = %lease.worker_id, "Lease no longer held");
        return Err(Error::LeaseLost(lease.job_id));
    }
    Ok(())
}

/// Job store backed by PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so any number of worker processes can
/// poll the same table without contending on a row.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and bring the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = create_pool(database_url, max_connections).await?;
        run_migrations(&pool).await?;
        info!(max_connections, "Connected PostgreSQL job store");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_logs(&self, id: Uuid) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT line FROM deploy_job_logs WHERE job_id = $1 ORDER BY seq ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)
    }

    /// Evict finished jobs beyond the retention thresholds. Logs go with them.
    async fn apply_retention(
        tx: &mut Transaction<'_, Postgres>,
        state: JobState,
        retention: &RetentionPolicy,
    ) -> Result<u64> {
        let keep = match state {
            JobState::Completed => retention.max_completed,
            JobState::Failed => retention.max_failed,
            _ => None,
        };

        let mut evicted = 0;
        if let Some(keep) = keep {
            evicted += sqlx::query(
                r#"
                DELETE FROM deploy_jobs
                WHERE id IN (
                    SELECT id FROM deploy_jobs
                    WHERE state = $1
                    ORDER BY finished_at DESC, id DESC
                    OFFSET $2
                )
                "#,
            )
            .bind(state.as_str())
            .bind(i64::try_from(keep).unwrap_or(i64::MAX))
            .execute(&mut **tx)
            .await
            .map_err(db)?
            .rows_affected();
        }

        if let Some(max_age) = retention.max_age_secs {
            evicted += sqlx::query(
                r#"
                DELETE FROM deploy_jobs
                WHERE state IN ('completed', 'failed')
                  AND finished_at < NOW() - make_interval(secs => $1)
                "#,
            )
            .bind(max_age as f64)
            .execute(&mut **tx)
            .await
            .map_err(db)?
            .rows_affected();
        }

        if evicted > 0 {
            debug!(evicted, state = %state, "Applied retention");
        }
        Ok(evicted)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn enqueue(&self, spec: DeploymentSpec, options: JobOptions) -> Result<JobId> {
        let id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO deploy_jobs (id, spec, state, options, enqueued_at, run_at)
            VALUES ($1, $2, 'waiting', $3, NOW(), NOW())
            "#,
        )
        .bind(id.as_uuid())
        .bind(Json(&spec))
        .bind(Json(&options))
        .execute(&self.pool)
        .await
        .map_err(db)?;

        info!(job_id = %id, deployment_id = %spec.deployment_id, "Enqueued job");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease_for: Duration) -> Result<Option<ClaimedJob>> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let stalled = sqlx::query_scalar::<_, Json<JobOptions>>(
            r#"
            UPDATE deploy_jobs
            SET state = 'failed', failed_reason = $1, finished_at = NOW(),
                lease_token = NULL, lease_worker = NULL, lease_expires_at = NULL
            WHERE state = 'active'
              AND lease_expires_at < NOW()
              AND attempts_made >= (options->>'max_attempts')::INTEGER
            RETURNING options
            "#,
        )
        .bind(STALLED_REASON)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        if !stalled.is_empty() {
            warn!(count = stalled.len(), "Failed jobs that stalled on their last attempt");
            for Json(options) in &stalled {
                Self::apply_retention(&mut tx, JobState::Failed, &options.retention).await?;
            }
        }

        let token = Uuid::new_v4();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deploy_jobs
            SET state = 'active',
                attempts_made = attempts_made + 1,
                runs = runs + 1,
                progress = 0,
                started_at = NOW(),
                lease_token = $2,
                lease_worker = $1,
                lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = (
                SELECT id FROM deploy_jobs
                WHERE (state = 'waiting' AND run_at <= NOW())
                   OR (state = 'active' AND lease_expires_at < NOW())
                ORDER BY run_at ASC, enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(token)
        .bind(lease_for.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let logs = self.fetch_logs(row.id).await?;
        let record = row.into_record(logs)?;
        let lease = Lease {
            job_id: record.id,
            token,
            worker_id: worker_id.to_string(),
            attempt: record.attempts_made,
            run: record.runs,
        };

        info!(job_id = %record.id, worker = %worker_id, attempt = lease.attempt, "Claimed job");
        Ok(Some(ClaimedJob { record, lease }))
    }

    async fn extend_lease(&self, lease: &Lease, lease_for: Duration) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE deploy_jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND lease_token = $2 AND state = 'active'
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token)
        .bind(lease_for.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        held(rows, lease)
    }

    async fn update_progress(&self, lease: &Lease, progress: u8) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE deploy_jobs
            SET progress = GREATEST(progress, $3)
            WHERE id = $1 AND lease_token = $2 AND state = 'active'
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token)
        .bind(i16::from(progress.min(100)))
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        held(rows, lease)
    }

    async fn append_log(&self, lease: &Lease, line: &str) -> Result<()> {
        let rows = sqlx::query(
            r#"
            INSERT INTO deploy_job_logs (job_id, line)
            SELECT id, $3 FROM deploy_jobs
            WHERE id = $1 AND lease_token = $2 AND state = 'active'
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token)
        .bind(line)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        held(rows, lease)
    }

    async fn complete(&self, lease: &Lease, result: &UploadResult) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let options = sqlx::query_scalar::<_, Json<JobOptions>>(
            r#"
            UPDATE deploy_jobs
            SET state = 'completed', progress = 100, result = $3, failed_reason = NULL,
                finished_at = NOW(),
                lease_token = NULL, lease_worker = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2 AND state = 'active'
            RETURNING options
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token)
        .bind(Json(result))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let Some(Json(options)) = options else {
            return Err(Error::LeaseLost(lease.job_id));
        };
        Self::apply_retention(&mut tx, JobState::Completed, &options.retention).await?;
        tx.commit().await.map_err(db)?;

        info!(job_id = %lease.job_id, "Job completed");
        Ok(())
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query_as::<_, (i32, Json<JobOptions>)>(
            r#"
            SELECT attempts_made, options FROM deploy_jobs
            WHERE id = $1 AND lease_token = $2 AND state = 'active'
            FOR UPDATE
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let Some((attempts_made, Json(options))) = row else {
            return Err(Error::LeaseLost(lease.job_id));
        };

        let outcome = next_after_failure(&options, attempts_made.max(0) as u32);
        match &outcome {
            FailOutcome::Retrying { attempt, delay } => {
                sqlx::query(
                    r#"
                    UPDATE deploy_jobs
                    SET state = 'waiting',
                        run_at = NOW() + make_interval(secs => $2),
                        lease_token = NULL, lease_worker = NULL, lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(lease.job_id.as_uuid())
                .bind(delay.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                info!(job_id = %lease.job_id, attempt, delay_ms = delay.as_millis() as u64, "Job will be retried");
            }
            FailOutcome::Failed { attempts } => {
                sqlx::query(
                    r#"
                    UPDATE deploy_jobs
                    SET state = 'failed', failed_reason = $2, finished_at = NOW(),
                        lease_token = NULL, lease_worker = NULL, lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(lease.job_id.as_uuid())
                .bind(reason)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                Self::apply_retention(&mut tx, JobState::Failed, &options.retention).await?;
                warn!(job_id = %lease.job_id, attempts, reason, "Job failed");
            }
        }

        tx.commit().await.map_err(db)?;
        Ok(outcome)
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE deploy_jobs
            SET state = 'waiting',
                attempts_made = GREATEST(attempts_made - 1, 0),
                run_at = NOW(),
                lease_token = NULL, lease_worker = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2 AND state = 'active'
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        held(rows, lease)?;

        info!(job_id = %lease.job_id, "Released job back to the queue");
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM deploy_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;

        match row {
            Some(row) => {
                let logs = self.fetch_logs(row.id).await?;
                Ok(Some(row.into_record(logs)?))
            }
            None => Ok(None),
        }
    }

    async fn logs(&self, job_id: JobId) -> Result<Option<Vec<String>>> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM deploy_jobs WHERE id = $1)",
        )
        .bind(job_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;

        if !exists {
            return Ok(None);
        }
        Ok(Some(self.fetch_logs(*job_id.as_uuid()).await?))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Closed PostgreSQL job store");
    }
}
