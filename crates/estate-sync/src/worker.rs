//! Queue consumer: claims scrape jobs, runs them with a lease heartbeat, applies retry backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use estate_core::{JobResult, ScrapeJobData, ScrapeResult, ScraperConfig};
use estate_storage::RetryBackoff;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::manager::{ProgressSink, ScraperManager};
use crate::queue::{QueueBroker, QueueError, QueuedJob, RetentionPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Progress reporting bound to one claimed job.
pub struct JobContext {
    broker: Arc<dyn QueueBroker>,
    job_id: Uuid,
}

impl JobContext {
    pub fn new(broker: Arc<dyn QueueBroker>, job_id: Uuid) -> Self {
        Self { broker, job_id }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn set_progress(&self, percent: u8) {
        if let Err(err) = self.broker.set_progress(self.job_id, percent).await {
            warn!(job_id = %self.job_id, error = %err, "progress update failed");
        }
    }
}

#[async_trait]
impl ProgressSink for JobContext {
    async fn source_finished(&self, done: usize, total: usize, _result: &ScrapeResult) {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        self.set_progress(percent.min(100) as u8).await;
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob, ctx: &JobContext) -> Result<Value, JobFailure>;
}

/// Decodes a scrape payload and runs its sources through the manager.
pub struct ScrapeJobHandler {
    manager: ScraperManager,
    template: ScraperConfig,
}

impl ScrapeJobHandler {
    pub fn new(manager: ScraperManager, template: ScraperConfig) -> Self {
        Self { manager, template }
    }
}

#[async_trait]
impl JobHandler for ScrapeJobHandler {
    async fn handle(&self, job: &QueuedJob, ctx: &JobContext) -> Result<Value, JobFailure> {
        let data: ScrapeJobData = serde_json::from_value(job.data.clone())
            .map_err(|err| JobFailure::permanent(format!("invalid job payload: {err}")))?;
        info!(
            job_id = %job.id,
            sources = ?data.sources,
            run_type = ?data.run_type,
            trigger = ?data.trigger,
            attempt = job.attempts_made,
            "processing scrape job"
        );

        let configs = data.scraper_configs(&self.template);
        let results = self.manager.scrape_all_with_progress(&configs, ctx).await;

        if !results.is_empty() && results.iter().all(|r| !r.success) {
            let reasons = results
                .iter()
                .flat_map(|r| r.errors.iter().map(move |e| format!("{}: {e}", r.source)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(JobFailure::retryable(format!("all sources failed: {reasons}")));
        }

        let aggregate = JobResult::aggregate(job.id, results);
        info!(
            job_id = %job.id,
            success = aggregate.success,
            properties = aggregate.total_properties_scraped,
            "scrape job finished"
        );
        serde_json::to_value(&aggregate)
            .map_err(|err| JobFailure::permanent(format!("unserializable job result: {err}")))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease: Duration,
    pub backoff: RetryBackoff,
    pub retention: RetentionPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            lease: Duration::from_secs(30 * 60),
            backoff: RetryBackoff::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Single-concurrency consumer: one job at a time per worker.
pub struct QueueWorker {
    broker: Arc<dyn QueueBroker>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(broker: Arc<dyn QueueBroker>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            broker,
            handler,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(worker_id = %self.config.worker_id, "queue worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => error!(error = %err, "failed to claim job"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "queue worker stopped");
        Ok(())
    }

    /// Claim and process at most one job. `Ok(false)` when nothing was due.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self
            .broker
            .claim_next(&self.config.worker_id, self.config.lease)
            .await?
        else {
            return Ok(false);
        };
        self.process(job).await;
        Ok(true)
    }

    /// Run a claimed job and record its outcome.
    pub async fn process(&self, job: QueuedJob) {
        let job_id = job.id;
        debug!(job_id = %job_id, attempt = job.attempts_made, "job claimed");

        let outcome = self.execute_with_heartbeat(&job).await;
        let recorded = match outcome {
            Ok(result) => {
                self.broker
                    .complete(job_id, &self.config.worker_id, result)
                    .await
            }
            Err(failure) => self.record_failure(&job, failure).await,
        };
        match recorded {
            Ok(()) => {}
            Err(QueueError::LeaseLost { .. }) => {
                warn!(job_id = %job_id, worker_id = %self.config.worker_id, "lease lost, outcome discarded");
            }
            Err(err) => error!(job_id = %job_id, error = %err, "failed to record job outcome"),
        }

        match self.broker.prune(self.config.retention).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned finished jobs"),
            Err(err) => warn!(error = %err, "job retention prune failed"),
        }
    }

    async fn record_failure(&self, job: &QueuedJob, failure: JobFailure) -> Result<(), QueueError> {
        if failure.retryable && job.attempts_made < job.max_attempts {
            let delay = self.config.backoff.delay_after(job.attempts_made);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
            warn!(
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                retry_in_secs = delay.as_secs(),
                error = %failure,
                "job failed, retry scheduled"
            );
            self.broker
                .fail(job.id, &self.config.worker_id, &failure.message, Some(retry_at))
                .await
        } else {
            error!(
                job_id = %job.id,
                attempt = job.attempts_made,
                retryable = failure.retryable,
                error = %failure,
                "job failed permanently"
            );
            self.broker
                .fail(job.id, &self.config.worker_id, &failure.message, None)
                .await
        }
    }

    async fn execute_with_heartbeat(&self, job: &QueuedJob) -> Result<Value, JobFailure> {
        let cancel = CancellationToken::new();
        let broker = Arc::clone(&self.broker);
        let lease = self.config.lease;
        let every = self.config.heartbeat_interval;
        let job_id = job.id;
        let worker_id = self.config.worker_id.clone();

        let heartbeat_cancel = cancel.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = broker.heartbeat(job_id, &worker_id, lease).await {
                            warn!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let ctx = JobContext::new(Arc::clone(&self.broker), job.id);
        let result = self.handler.handle(job, &ctx).await;

        cancel.cancel();
        let _ = heartbeat.await;
        result
    }
}
