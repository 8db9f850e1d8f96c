//! [`JobStore`] over PostgreSQL.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block
//! on, or double-claim, the same row. Lock keys are enforced by a partial
//! unique index over live statuses, so a job releases its key the moment
//! it turns terminal.

use super::NOTIFY_CHANNEL;
use crate::clock::{sub_duration, SharedClock};
use crate::error::{ExecutionError, JobError, JobResult};
use crate::job::{Job, JobId, JobStatus, LastError, NewJob};
use crate::registry::TaskRegistry;
use crate::store::{apply_failure, FailOutcome, JobStore, QueueStats, ReclaimedJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unique index that holds lock keys of live jobs.
const LOCK_KEY_INDEX: &str = "keel_jobs_lock_key_live_idx";

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    task_name: String,
    arguments: serde_json::Value,
    queue: String,
    status: String,
    attempts: i32,
    scheduled_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    claim_owner: Option<String>,
    last_error_class: Option<String>,
    last_error_message: Option<String>,
    lock_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<JobStatus>().map_err(JobError::Internal)?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| JobError::Internal(format!("negative attempts on job {}", row.id)))?;
        let last_error = row.last_error_class.map(|class| LastError {
            class,
            message: row.last_error_message.unwrap_or_default(),
        });

        Ok(Job {
            id: JobId::from(row.id),
            task_name: row.task_name,
            arguments: row.arguments,
            queue: row.queue,
            status,
            attempts,
            scheduled_at: row.scheduled_at,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            claim_owner: row.claim_owner,
            last_error,
            lock_key: row.lock_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Job store backed by the `keel_jobs` table.
pub struct PgJobStore {
    pool: PgPool,
    registry: Arc<TaskRegistry>,
    clock: SharedClock,
    notify: Notify,
}

impl PgJobStore {
    /// Creates a store over an existing pool. The schema must already be
    /// migrated.
    pub fn new(pool: PgPool, registry: Arc<TaskRegistry>, clock: SharedClock) -> Self {
        Self {
            pool,
            registry,
            clock,
            notify: Notify::new(),
        }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Relays `NOTIFY keel_jobs` to waiting workers until `shutdown` fires.
    ///
    /// Without a running listener workers still find new jobs, but only
    /// once per poll interval.
    pub async fn listen(&self, shutdown: CancellationToken) -> JobResult<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        info!(channel = NOTIFY_CHANNEL, "Listening for job notifications");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = listener.recv() => match received {
                    Ok(notification) => {
                        debug!(payload = notification.payload(), "Job notification");
                        self.notify.notify_waiters();
                    }
                    Err(err) => {
                        // The listener reconnects on the next recv.
                        warn!(error = %err, "Job notification listener failed");
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                },
            }
        }

        info!("Job notification listener stopped");
        Ok(())
    }

    async fn write_back(tx: &mut Transaction<'_, Postgres>, job: &Job) -> JobResult<()> {
        let (class, message) = match &job.last_error {
            Some(err) => (Some(err.class.as_str()), Some(err.message.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE keel_jobs
            SET status = $2,
                attempts = $3,
                scheduled_at = $4,
                claimed_at = NULL,
                heartbeat_at = NULL,
                claim_owner = NULL,
                last_error_class = $5,
                last_error_message = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id.get())
        .bind(job.status.as_str())
        .bind(attempts_column(job.attempts))
        .bind(job.scheduled_at)
        .bind(class)
        .bind(message)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn is_lock_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                && db_err.constraint().map_or(true, |c| c == LOCK_KEY_INDEX)
        }
        _ => false,
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        let now = self.clock.now();
        let scheduled_at = job.schedule.resolve(now);

        let inserted: Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO keel_jobs
                (task_name, arguments, queue, status, attempts, scheduled_at, lock_key, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $6)
            RETURNING id
            "#,
        )
        .bind(&job.task_name)
        .bind(&job.arguments)
        .bind(&job.queue)
        .bind(scheduled_at)
        .bind(job.lock_key.as_deref())
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok((id,)) => Ok(JobId::from(id)),
            Err(err) if is_lock_key_violation(&err) => Err(JobError::DuplicateLock {
                lock_key: job.lock_key.unwrap_or_default(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn claim_next(&self, queues: &[String], worker_id: &str) -> JobResult<Option<Job>> {
        let now = self.clock.now();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE keel_jobs
            SET status = 'in_progress',
                claimed_at = $3,
                heartbeat_at = $3,
                claim_owner = $2,
                updated_at = $3
            WHERE id = (
                SELECT id
                FROM keel_jobs
                WHERE status = 'pending'
                  AND queue = ANY($1)
                  AND scheduled_at <= $3
                ORDER BY scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queues)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE keel_jobs
            SET heartbeat_at = $3
            WHERE id = $1 AND status = 'in_progress' AND claim_owner = $2
            "#,
        )
        .bind(job_id.get())
        .bind(worker_id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, job_id: JobId, worker_id: &str) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE keel_jobs
            SET status = 'succeeded',
                attempts = attempts + 1,
                claimed_at = NULL,
                heartbeat_at = NULL,
                claim_owner = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'in_progress' AND claim_owner = $2
            "#,
        )
        .bind(job_id.get())
        .bind(worker_id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(job_id = %job_id, worker_id, "Discarding late completion");
        }
        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> JobResult<Option<FailOutcome>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM keel_jobs
            WHERE id = $1 AND status = 'in_progress' AND claim_owner = $2
            FOR UPDATE
            "#,
        )
        .bind(job_id.get())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            debug!(job_id = %job_id, worker_id, "Discarding late failure");
            return Ok(None);
        };

        let mut job = Job::try_from(row)?;
        let policy = self.registry.retry_policy(&job.task_name);
        let outcome = apply_failure(&mut job, &policy, error, self.clock.now());

        Self::write_back(&mut tx, &job).await?;
        tx.commit().await?;

        Ok(Some(outcome))
    }

    async fn reclaim_stalled(&self, threshold: Duration) -> JobResult<Vec<ReclaimedJob>> {
        let now = self.clock.now();
        let cutoff = sub_duration(now, threshold);
        let error = ExecutionError::worker_lost();

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM keel_jobs
            WHERE status = 'in_progress'
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Job::try_from(row)?;
            let previous_owner = job.claim_owner.clone();
            let policy = self.registry.retry_policy(&job.task_name);
            let outcome = apply_failure(&mut job, &policy, &error, now);

            Self::write_back(&mut tx, &job).await?;
            reclaimed.push(ReclaimedJob {
                job,
                previous_owner,
                outcome,
            });
        }

        tx.commit().await?;
        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> JobResult<Option<Job>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM keel_jobs WHERE id = $1")
            .bind(job_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn cancel(&self, job_id: JobId) -> JobResult<bool> {
        let cancelled = sqlx::query(
            r#"
            UPDATE keel_jobs
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id.get())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if cancelled.rows_affected() == 1 {
            return Ok(true);
        }

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM keel_jobs WHERE id = $1")
                .bind(job_id.get())
                .fetch_optional(&self.pool)
                .await?;

        match status {
            None => Err(JobError::NotFound(job_id)),
            Some((status,)) if status == JobStatus::InProgress.as_str() => {
                Err(JobError::InvalidState {
                    expected: JobStatus::Pending.to_string(),
                    actual: status,
                })
            }
            Some(_) => Ok(false),
        }
    }

    async fn purge_terminal(&self, older_than: Duration) -> JobResult<u64> {
        let cutoff = sub_duration(self.clock.now(), older_than);
        let result = sqlx::query(
            r#"
            DELETE FROM keel_jobs
            WHERE status IN ('succeeded', 'failed', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> JobResult<Vec<QueueStats>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT queue, status, COUNT(*) FROM keel_jobs GROUP BY queue, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_queue: BTreeMap<String, QueueStats> = BTreeMap::new();
        for (queue, status, count) in rows {
            let status = status.parse::<JobStatus>().map_err(JobError::Internal)?;
            by_queue
                .entry(queue.clone())
                .or_insert_with(|| QueueStats::new(queue))
                .add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(by_queue.into_values().collect())
    }

    async fn health_check(&self) -> JobResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn wait_for_jobs(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
