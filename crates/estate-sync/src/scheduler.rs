//! Cron-driven job producer. Ticks only enqueue; scraping happens in the worker.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use croner::Cron;
use estate_core::{JobPriority, JobTrigger, RunType, ScrapeJobRequest, SourceId};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::queue::ScrapeQueue;

pub const SCHEDULE_TIMEZONE: &str = "UTC";
pub const SOURCE_SYNC_SCHEDULE_ID: &str = "source-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleTask {
    Scrape(ScrapeJobRequest),
    /// Driven by `ReconcileDaemon`, listed here for the schedule view.
    SourceSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDefinition {
    pub id: String,
    pub name: String,
    /// Six fields, seconds first.
    pub cron: String,
    pub description: String,
    pub task: ScheduleTask,
}

impl ScheduleDefinition {
    fn scrape(id: &str, name: &str, cron: &str, description: &str, request: ScrapeJobRequest) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            cron: cron.to_string(),
            description: description.to_string(),
            task: ScheduleTask::Scrape(ScrapeJobRequest {
                trigger: Some(JobTrigger::Scheduled),
                schedule_id: Some(id.to_string()),
                ..request
            }),
        }
    }

    pub fn job_request(&self) -> Option<&ScrapeJobRequest> {
        match &self.task {
            ScheduleTask::Scrape(request) => Some(request),
            ScheduleTask::SourceSync => None,
        }
    }

    pub fn next_run_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let cron = Cron::new(&self.cron)
            .with_seconds_required()
            .parse()
            .map_err(|err| anyhow!("parsing cron `{}` for {}: {err:?}", self.cron, self.id))?;
        cron.find_next_occurrence(&now, false)
            .map_err(|err| anyhow!("computing next run for {}: {err:?}", self.id))
    }
}

fn strings(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

/// Wall-clock Tunis times are one hour ahead of these UTC expressions.
pub fn default_schedules() -> Vec<ScheduleDefinition> {
    vec![
        ScheduleDefinition::scrape(
            "full-scrape",
            "Full scrape (all sources)",
            "0 0 1 * * *",
            "Daily at 02:00 Tunis time, 10 pages per source",
            ScrapeJobRequest {
                run_type: Some(RunType::Full),
                max_pages: Some(10),
                priority: Some(JobPriority::Normal),
                ..ScrapeJobRequest::default()
            },
        ),
        ScheduleDefinition::scrape(
            "incremental-scrape",
            "Incremental scrape (all sources)",
            "0 0 */6 * * *",
            "Every 6 hours, 3 pages per source",
            ScrapeJobRequest {
                run_type: Some(RunType::Incremental),
                max_pages: Some(3),
                priority: Some(JobPriority::Normal),
                ..ScrapeJobRequest::default()
            },
        ),
        ScheduleDefinition::scrape(
            "hot-listings",
            "Hot listings (Tayara)",
            "0 0 */2 * * *",
            "Every 2 hours, greater Tunis only",
            ScrapeJobRequest {
                sources: Some(vec![SourceId::Tayara]),
                run_type: Some(RunType::Incremental),
                governorates: strings(&["Tunis", "La Marsa", "Carthage", "Ariana"]),
                max_pages: Some(3),
                priority: Some(JobPriority::High),
                ..ScrapeJobRequest::default()
            },
        ),
        ScheduleDefinition::scrape(
            "premium-properties",
            "Premium properties (Mubawab)",
            "0 0 */4 * * *",
            "Every 4 hours, villas and apartments in Tunis, Sousse and Sfax",
            ScrapeJobRequest {
                sources: Some(vec![SourceId::Mubawab]),
                run_type: Some(RunType::Incremental),
                governorates: strings(&["Tunis", "Sousse", "Sfax"]),
                property_types: strings(&["villa", "apartment"]),
                max_pages: Some(5),
                priority: Some(JobPriority::Normal),
                ..ScrapeJobRequest::default()
            },
        ),
        ScheduleDefinition {
            id: SOURCE_SYNC_SCHEDULE_ID.to_string(),
            name: "Source sync agent".to_string(),
            cron: "0 30 */3 * * *".to_string(),
            description: "Every 3 hours at :30".to_string(),
            task: ScheduleTask::SourceSync,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleView {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub description: String,
    pub timezone: &'static str,
    pub next_run: Option<DateTime<Utc>>,
    pub ms_until_next_run: Option<i64>,
}

pub fn schedule_views(schedules: &[ScheduleDefinition], now: DateTime<Utc>) -> Vec<ScheduleView> {
    schedules
        .iter()
        .map(|schedule| {
            let next_run = match schedule.next_run_after(now) {
                Ok(next) => Some(next),
                Err(err) => {
                    error!(schedule = %schedule.id, error = %format!("{err:#}"), "bad cron expression");
                    None
                }
            };
            ScheduleView {
                id: schedule.id.clone(),
                name: schedule.name.clone(),
                cron: schedule.cron.clone(),
                description: schedule.description.clone(),
                timezone: SCHEDULE_TIMEZONE,
                next_run,
                ms_until_next_run: next_run.map(|at| (at - now).num_milliseconds()),
            }
        })
        .collect()
}

/// Enqueue the job for one scheduled tick.
pub async fn fire(queue: &ScrapeQueue, schedule: &ScheduleDefinition) -> Result<Option<uuid::Uuid>> {
    let Some(request) = schedule.job_request() else {
        return Ok(None);
    };
    let handle = queue
        .enqueue(request.clone())
        .await
        .with_context(|| format!("enqueueing scheduled job {}", schedule.id))?;
    info!(schedule = %schedule.id, job_id = %handle.id, "scheduled job enqueued");
    Ok(Some(handle.id))
}

pub struct ScrapeScheduler {
    queue: ScrapeQueue,
    schedules: Vec<ScheduleDefinition>,
    inner: Option<JobScheduler>,
}

impl ScrapeScheduler {
    pub fn new(queue: ScrapeQueue) -> Self {
        Self::with_schedules(queue, default_schedules())
    }

    pub fn with_schedules(queue: ScrapeQueue, schedules: Vec<ScheduleDefinition>) -> Self {
        Self {
            queue,
            schedules,
            inner: None,
        }
    }

    pub fn schedules(&self) -> &[ScheduleDefinition] {
        &self.schedules
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for schedule in self.schedules.iter().filter(|s| s.job_request().is_some()) {
            let queue = self.queue.clone();
            let definition = schedule.clone();
            let job = Job::new_async(schedule.cron.as_str(), move |_uuid, _l| {
                let queue = queue.clone();
                let definition = definition.clone();
                Box::pin(async move {
                    if let Err(err) = fire(&queue, &definition).await {
                        error!(schedule = %definition.id, error = %format!("{err:#}"), "scheduled tick failed");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {}", schedule.cron))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(schedule = %schedule.id, cron = %schedule.cron, "schedule registered");
        }
        sched.start().await.context("starting scheduler")?;
        self.inner = Some(sched);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut sched) = self.inner.take() {
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Ok(())
    }
}
