//! Durable, priority-ordered scrape job queue.
//!
//! Jobs move `waiting -> active -> completed | failed`. A failed attempt with
//! retries left goes to `delayed` until its `run_at`. Active jobs carry a lease
//! owned by the claiming worker; a job whose lease expires is reclaimed by the
//! next claim, or failed outright once its attempts are spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{JobState, ScrapeJobData, ScrapeJobRequest};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::QUEUE_NAME;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("corrupt job row {id}: {message}")]
    Corrupt { id: Uuid, message: String },
    #[error("worker {worker_id} no longer holds the lease on job {id}")]
    LeaseLost { id: Uuid, worker_id: String },
}

pub const STALLED_REASON: &str = "job stalled; attempts exhausted";

#[derive(Debug, Clone)]
pub struct NewJob {
    pub data: Value,
    pub priority: i16,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub state: JobState,
    pub priority: i16,
    pub data: Value,
    pub result: Option<Value>,
    pub progress: u8,
    /// Attempts started so far, including the current one while active.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Worker holding the current lease.
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at < now)
    }

    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting | JobState::Delayed => self.run_at.map_or(true, |at| at <= now),
            JobState::Active => self.lease_expired(now) && self.attempts_made < self.max_attempts,
            JobState::Completed | JobState::Failed => false,
        }
    }

    fn is_leased_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Active && self.worker_id.as_deref() == Some(worker_id)
    }

    fn order_key(&self) -> (i16, DateTime<Utc>) {
        (self.priority, self.run_at.unwrap_or(self.created_at))
    }
}

/// How many finished jobs of each kind survive pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 200,
        }
    }
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Uuid, QueueError>;

    /// Claim the most urgent eligible job, counting a new attempt and taking a lease.
    /// Stalled jobs with no attempts left are failed instead of handed out.
    async fn claim_next(&self, worker_id: &str, lease: Duration) -> Result<Option<QueuedJob>, QueueError>;

    /// Extend the lease. `LeaseLost` when `worker_id` no longer holds it.
    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<(), QueueError>;

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<(), QueueError>;

    /// `LeaseLost` when the job was reclaimed or finished by someone else.
    async fn complete(&self, id: Uuid, worker_id: &str, result: Value) -> Result<(), QueueError>;

    /// `retry_at = Some(_)` parks the job as delayed; `None` fails it for good.
    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError>;

    async fn get(&self, id: Uuid) -> Result<Option<QueuedJob>, QueueError>;

    /// Delete the oldest finished jobs beyond the retention caps; returns rows removed.
    async fn prune(&self, retention: RetentionPolicy) -> Result<u64, QueueError>;
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// In-process broker for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim for `worker_id` as if the clock read `now`.
    pub async fn claim_due_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        for job in jobs
            .iter_mut()
            .filter(|job| job.lease_expired(now) && job.attempts_made >= job.max_attempts)
        {
            warn!(job_id = %job.id, attempts = job.attempts_made, "stalled job has no attempts left");
            job.state = JobState::Failed;
            job.failed_reason = Some(STALLED_REASON.to_string());
            job.lease_expires_at = None;
            job.worker_id = None;
            job.finished_at = Some(now);
        }

        let next = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_claimable(now))
            .min_by_key(|(index, job)| (job.order_key(), *index))
            .map(|(index, _)| index);
        let Some(index) = next else {
            return Ok(None);
        };
        let job = &mut jobs[index];
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.lease_expires_at = Some(lease_deadline(now, lease));
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    pub async fn all(&self) -> Vec<QueuedJob> {
        self.jobs.lock().await.clone()
    }

    async fn with_job<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut QueuedJob) -> T + Send,
    ) -> Result<T, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(QueueError::NotFound(id))?;
        Ok(f(job))
    }

    async fn with_leased_job(
        &self,
        id: Uuid,
        worker_id: &str,
        f: impl FnOnce(&mut QueuedJob) + Send,
    ) -> Result<(), QueueError> {
        let owned = self
            .with_job(id, |job| {
                let owned = job.is_leased_by(worker_id);
                if owned {
                    f(job);
                }
                owned
            })
            .await?;
        if owned {
            Ok(())
        } else {
            Err(QueueError::LeaseLost {
                id,
                worker_id: worker_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn insert(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        self.jobs.lock().await.push(QueuedJob {
            id,
            state: JobState::Waiting,
            priority: job.priority,
            data: job.data,
            result: None,
            progress: 0,
            attempts_made: 0,
            max_attempts: job.max_attempts,
            failed_reason: None,
            run_at: None,
            lease_expires_at: None,
            worker_id: None,
            created_at: Utc::now(),
            finished_at: None,
        });
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str, lease: Duration) -> Result<Option<QueuedJob>, QueueError> {
        self.claim_due_at(worker_id, Utc::now(), lease).await
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<(), QueueError> {
        self.with_leased_job(id, worker_id, |job| {
            job.lease_expires_at = Some(lease_deadline(Utc::now(), lease));
        })
        .await
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<(), QueueError> {
        self.with_job(id, |job| job.progress = progress.min(100)).await
    }

    async fn complete(&self, id: Uuid, worker_id: &str, result: Value) -> Result<(), QueueError> {
        self.with_leased_job(id, worker_id, |job| {
            job.state = JobState::Completed;
            job.result = Some(result);
            job.progress = 100;
            job.lease_expires_at = None;
            job.worker_id = None;
            job.finished_at = Some(Utc::now());
        })
        .await
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let reason = reason.to_string();
        self.with_leased_job(id, worker_id, move |job| {
            job.failed_reason = Some(reason);
            job.lease_expires_at = None;
            job.worker_id = None;
            match retry_at {
                Some(at) => {
                    job.state = JobState::Delayed;
                    job.run_at = Some(at);
                }
                None => {
                    job.state = JobState::Failed;
                    job.finished_at = Some(Utc::now());
                }
            }
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.jobs.lock().await.iter().find(|job| job.id == id).cloned())
    }

    async fn prune(&self, retention: RetentionPolicy) -> Result<u64, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        for (state, keep) in [
            (JobState::Completed, retention.keep_completed),
            (JobState::Failed, retention.keep_failed),
        ] {
            let mut finished = jobs
                .iter()
                .filter(|job| job.state == state)
                .map(|job| (job.finished_at, job.id))
                .collect::<Vec<_>>();
            finished.sort_by(|a, b| b.0.cmp(&a.0));
            let doomed = finished
                .into_iter()
                .skip(keep)
                .map(|(_, id)| id)
                .collect::<Vec<_>>();
            jobs.retain(|job| !doomed.contains(&job.id));
        }
        Ok((before - jobs.len()) as u64)
    }
}

/// Active jobs whose lease ran out after their last allowed attempt.
const FAIL_STALLED_SQL: &str = r#"
    UPDATE scrape_jobs
    SET status = 'failed',
        failed_reason = $2,
        lease_expires_at = NULL,
        worker_id = NULL,
        finished_at = NOW(),
        updated_at = NOW()
    WHERE queue = $1
      AND status = 'active'
      AND lease_expires_at < NOW()
      AND attempts_made >= max_attempts
"#;

fn claim_sql() -> String {
    format!(
        r#"
        WITH next_job AS (
            SELECT id
            FROM scrape_jobs
            WHERE queue = $1
              AND (
                  (status IN ('waiting', 'delayed') AND (run_at IS NULL OR run_at <= NOW()))
                  OR (status = 'active' AND lease_expires_at < NOW() AND attempts_made < max_attempts)
              )
            ORDER BY priority, COALESCE(run_at, created_at)
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE scrape_jobs
        SET status = 'active',
            attempts_made = attempts_made + 1,
            lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
            worker_id = $3,
            updated_at = NOW()
        WHERE id IN (SELECT id FROM next_job)
        RETURNING {JOB_COLUMNS}
        "#
    )
}

fn lease_held(rows: u64, id: Uuid, worker_id: &str) -> Result<(), QueueError> {
    if rows == 0 {
        Err(QueueError::LeaseLost {
            id,
            worker_id: worker_id.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Postgres broker over `scrape_jobs`, claiming with `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    queue: String,
}

const JOB_COLUMNS: &str = "id, status, priority, data, result, progress, attempts_made, \
     max_attempts, failed_reason, run_at, lease_expires_at, worker_id, created_at, finished_at";

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<QueuedJob, QueueError> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let state = JobState::parse(&status).ok_or_else(|| QueueError::Corrupt {
        id,
        message: format!("unknown status {status}"),
    })?;
    let progress: i16 = row.try_get("progress")?;
    let attempts_made: i32 = row.try_get("attempts_made")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    Ok(QueuedJob {
        id,
        state,
        priority: row.try_get("priority")?,
        data: row.try_get("data")?,
        result: row.try_get("result")?,
        progress: progress.clamp(0, 100) as u8,
        attempts_made: attempts_made.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        failed_reason: row.try_get("failed_reason")?,
        run_at: row.try_get("run_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        worker_id: row.try_get("worker_id")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            queue: QUEUE_NAME.to_string(),
        }
    }

    pub fn with_queue(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    async fn prune_state(&self, status: &str, keep: usize) -> Result<u64, QueueError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM scrape_jobs
            WHERE queue = $1
              AND status = $2
              AND id NOT IN (
                  SELECT id FROM scrape_jobs
                  WHERE queue = $1 AND status = $2
                  ORDER BY finished_at DESC NULLS LAST
                  LIMIT $3
              )
            "#,
        )
        .bind(&self.queue)
        .bind(status)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }
}

#[async_trait]
impl QueueBroker for PgBroker {
    async fn insert(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs (id, queue, status, priority, data, max_attempts)
            VALUES ($1, $2, 'waiting', $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&self.queue)
        .bind(job.priority)
        .bind(&job.data)
        .bind(job.max_attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str, lease: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let stalled = sqlx::query(FAIL_STALLED_SQL)
            .bind(&self.queue)
            .bind(STALLED_REASON)
            .execute(&self.pool)
            .await?;
        if stalled.rows_affected() > 0 {
            warn!(queue = %self.queue, jobs = stalled.rows_affected(), "failed stalled jobs with no attempts left");
        }

        let sql = claim_sql();
        let row = sqlx::query(&sql)
            .bind(&self.queue)
            .bind(lease.as_millis().to_string())
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<(), QueueError> {
        let updated = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'active' AND worker_id = $3
            "#,
        )
        .bind(lease.as_millis().to_string())
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        lease_held(updated.rows_affected(), id, worker_id)
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<(), QueueError> {
        sqlx::query("UPDATE scrape_jobs SET progress = $1, updated_at = NOW() WHERE id = $2")
            .bind(i16::from(progress.min(100)))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete(&self, id: Uuid, worker_id: &str, result: Value) -> Result<(), QueueError> {
        let updated = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = 'completed',
                result = $1,
                progress = 100,
                lease_expires_at = NULL,
                worker_id = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $2 AND status = 'active' AND worker_id = $3
            "#,
        )
        .bind(&result)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        lease_held(updated.rows_affected(), id, worker_id)
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let query = match retry_at {
            Some(at) => sqlx::query(
                r#"
                UPDATE scrape_jobs
                SET status = 'delayed',
                    failed_reason = $1,
                    run_at = $4,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    updated_at = NOW()
                WHERE id = $2 AND status = 'active' AND worker_id = $3
                "#,
            )
            .bind(reason)
            .bind(id)
            .bind(worker_id)
            .bind(at),
            None => sqlx::query(
                r#"
                UPDATE scrape_jobs
                SET status = 'failed',
                    failed_reason = $1,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $2 AND status = 'active' AND worker_id = $3
                "#,
            )
            .bind(reason)
            .bind(id)
            .bind(worker_id),
        };
        let updated = query.execute(&self.pool).await?;
        lease_held(updated.rows_affected(), id, worker_id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedJob>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn prune(&self, retention: RetentionPolicy) -> Result<u64, QueueError> {
        let completed = self.prune_state("completed", retention.keep_completed).await?;
        let failed = self.prune_state("failed", retention.keep_failed).await?;
        Ok(completed + failed)
    }
}

/// Status object returned for a job id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: Uuid,
    pub state: JobState,
    pub progress: u8,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<QueuedJob> for JobStatusView {
    fn from(job: QueuedJob) -> Self {
        Self {
            id: job.id,
            state: job.state,
            progress: job.progress,
            data: job.data,
            result: job.result,
            failed_reason: job.failed_reason,
            attempts_made: job.attempts_made,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    pub data: ScrapeJobData,
}

/// Producer-side handle: enqueue scrape jobs and read their status.
#[derive(Clone)]
pub struct ScrapeQueue {
    broker: Arc<dyn QueueBroker>,
    max_attempts: u32,
}

impl ScrapeQueue {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            broker,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    pub async fn enqueue(&self, request: ScrapeJobRequest) -> Result<JobHandle, QueueError> {
        let data = request.into_job_data();
        let id = self
            .broker
            .insert(NewJob {
                data: serde_json::to_value(&data)?,
                priority: data.priority.as_i16(),
                max_attempts: self.max_attempts,
            })
            .await?;
        info!(
            job_id = %id,
            sources = ?data.sources,
            priority = data.priority.as_str(),
            max_pages = data.max_pages,
            "scrape job queued"
        );
        Ok(JobHandle { id, data })
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Option<JobStatusView>, QueueError> {
        let job = self.broker.get(id).await?;
        debug!(job_id = %id, found = job.is_some(), "job status lookup");
        Ok(job.map(JobStatusView::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::{JobPriority, RunType, SourceId};

    const LEASE: Duration = Duration::from_secs(1800);

    #[tokio::test]
    async fn enqueue_applies_defaults_and_reports_waiting() {
        let queue = ScrapeQueue::new(Arc::new(MemoryBroker::new()));
        let handle = queue
            .enqueue(ScrapeJobRequest {
                sources: Some(vec![SourceId::Tayara]),
                ..ScrapeJobRequest::default()
            })
            .await
            .expect("enqueue");

        assert_eq!(handle.data.run_type, RunType::Incremental);
        assert_eq!(handle.data.max_pages, 5);

        let status = queue.get_status(handle.id).await.expect("status").expect("job");
        assert_eq!(status.state, JobState::Waiting);
        assert_eq!(status.progress, 0);
        assert_eq!(status.attempts_made, 0);
        assert_eq!(status.data["sources"], serde_json::json!(["tayara"]));
        assert!(queue.get_status(Uuid::new_v4()).await.expect("status").is_none());
    }

    #[tokio::test]
    async fn high_priority_is_claimed_before_earlier_normal() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = ScrapeQueue::new(broker.clone());
        let normal = queue.enqueue(ScrapeJobRequest::default()).await.expect("normal");
        let high = queue
            .enqueue(ScrapeJobRequest {
                priority: Some(JobPriority::High),
                ..ScrapeJobRequest::default()
            })
            .await
            .expect("high");

        let first = broker.claim_next("w", LEASE).await.expect("claim").expect("job");
        let second = broker.claim_next("w", LEASE).await.expect("claim").expect("job");
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, normal.id);
        assert!(broker.claim_next("w", LEASE).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let broker = MemoryBroker::new();
        let id = broker
            .insert(NewJob {
                data: serde_json::json!({}),
                priority: 5,
                max_attempts: 3,
            })
            .await
            .expect("insert");

        let now = Utc::now();
        let claimed = broker.claim_due_at("w", now, Duration::from_secs(60)).await.expect("claim");
        assert_eq!(claimed.map(|j| j.attempts_made), Some(1));
        assert!(broker.claim_due_at("w", now, LEASE).await.expect("claim").is_none());

        let later = now + chrono::Duration::minutes(5);
        let reclaimed = broker.claim_due_at("w", later, LEASE).await.expect("claim").expect("job");
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts_made, 2);
    }

    #[tokio::test]
    async fn delayed_job_waits_for_run_at() {
        let broker = MemoryBroker::new();
        let id = broker
            .insert(NewJob {
                data: serde_json::json!({}),
                priority: 5,
                max_attempts: 3,
            })
            .await
            .expect("insert");
        let now = Utc::now();
        broker.claim_due_at("w", now, LEASE).await.expect("claim");
        broker
            .fail(id, "w", "boom", Some(now + chrono::Duration::seconds(60)))
            .await
            .expect("fail");

        assert!(broker.claim_due_at("w", now, LEASE).await.expect("claim").is_none());
        let due = now + chrono::Duration::seconds(61);
        assert!(broker.claim_due_at("w", due, LEASE).await.expect("claim").is_some());
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_finished_jobs() {
        let broker = MemoryBroker::new();
        for _ in 0..5 {
            let id = broker
                .insert(NewJob {
                    data: serde_json::json!({}),
                    priority: 5,
                    max_attempts: 1,
                })
                .await
                .expect("insert");
            broker.claim_next("w", LEASE).await.expect("claim");
            broker.complete(id, "w", serde_json::json!({"ok": true})).await.expect("complete");
        }
        let pending = broker
            .insert(NewJob {
                data: serde_json::json!({}),
                priority: 5,
                max_attempts: 1,
            })
            .await
            .expect("insert");

        let removed = broker
            .prune(RetentionPolicy {
                keep_completed: 2,
                keep_failed: 2,
            })
            .await
            .expect("prune");
        assert_eq!(removed, 3);
        let left = broker.all().await;
        assert_eq!(left.len(), 3);
        assert!(left.iter().any(|j| j.id == pending));
    }

    fn new_job() -> NewJob {
        NewJob {
            data: serde_json::json!({}),
            priority: 5,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn stalled_job_fails_once_attempts_are_spent() {
        let broker = MemoryBroker::new();
        let id = broker.insert(new_job()).await.expect("insert");
        let lease = Duration::from_secs(60);

        let mut now = Utc::now();
        let mut attempts = Vec::new();
        for _ in 0..5 {
            if let Some(job) = broker.claim_due_at("stuck", now, lease).await.expect("claim") {
                attempts.push(job.attempts_made);
            }
            now += chrono::Duration::minutes(5);
        }

        assert_eq!(attempts, vec![1, 2, 3]);
        let job = broker.get(id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));
        assert!(job.finished_at.is_some());
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn outcome_from_a_reclaimed_lease_is_rejected() {
        let broker = MemoryBroker::new();
        let id = broker.insert(new_job()).await.expect("insert");
        let now = Utc::now();
        broker
            .claim_due_at("first", now, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("job");
        let reclaimed = broker
            .claim_due_at("second", now + chrono::Duration::minutes(5), LEASE)
            .await
            .expect("claim")
            .expect("job");
        assert_eq!(reclaimed.worker_id.as_deref(), Some("second"));

        let stale = broker.complete(id, "first", serde_json::json!({"stale": true})).await;
        assert!(matches!(stale, Err(QueueError::LeaseLost { .. })), "{stale:?}");
        let stale = broker.fail(id, "first", "late failure", None).await;
        assert!(matches!(stale, Err(QueueError::LeaseLost { .. })), "{stale:?}");
        let stale = broker.heartbeat(id, "first", LEASE).await;
        assert!(matches!(stale, Err(QueueError::LeaseLost { .. })), "{stale:?}");

        broker.heartbeat(id, "second", LEASE).await.expect("owner heartbeat");
        broker
            .complete(id, "second", serde_json::json!({"ok": true}))
            .await
            .expect("owner completes");
        let job = broker.get(id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(serde_json::json!({"ok": true})));
        assert!(job.failed_reason.is_none());

        let again = broker.complete(id, "second", serde_json::json!({})).await;
        assert!(matches!(again, Err(QueueError::LeaseLost { .. })), "{again:?}");
    }

    #[test]
    fn claim_query_never_reissues_an_exhausted_lease() {
        let sql = claim_sql();
        assert!(sql.contains("lease_expires_at < NOW() AND attempts_made < max_attempts"));
        assert!(FAIL_STALLED_SQL.contains("attempts_made >= max_attempts"));
        assert!(FAIL_STALLED_SQL.contains("status = 'active'"));
    }

    /// Runs against Postgres only when `ESTATE_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn pg_stalled_job_fails_and_stale_outcome_is_rejected() {
        let Ok(url) = std::env::var("ESTATE_TEST_DATABASE_URL") else {
            return;
        };
        let pool = crate::connect_pool(&url).await.expect("pool");
        crate::run_migrations(&pool).await.expect("migrations");
        let broker = PgBroker::with_queue(pool, format!("test-{}", Uuid::new_v4()));
        let id = broker.insert(new_job()).await.expect("insert");
        let short = Duration::from_millis(1);

        for attempt in 1..=3 {
            let job = broker
                .claim_next(&format!("stuck-{attempt}"), short)
                .await
                .expect("claim")
                .expect("job");
            assert_eq!(job.attempts_made, attempt);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(broker.claim_next("stuck-4", short).await.expect("claim").is_none());

        let job = broker.get(id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));

        let stale = broker.complete(id, "stuck-3", serde_json::json!({})).await;
        assert!(matches!(stale, Err(QueueError::LeaseLost { .. })), "{stale:?}");
    }
}
