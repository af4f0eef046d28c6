use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use estate_adapters::SourceScraper;
use estate_core::{ScrapeResult, ScraperConfig};
use tracing::{error, info, warn};

/// Runs one source. An `Err` is a fatal failure for that source only.
#[async_trait]
pub trait SourceRunner: Send + Sync {
    async fn run_source(&self, config: &ScraperConfig) -> anyhow::Result<ScrapeResult>;
}

#[async_trait]
impl SourceRunner for SourceScraper {
    async fn run_source(&self, config: &ScraperConfig) -> anyhow::Result<ScrapeResult> {
        Ok(self.run(config).await)
    }
}

/// Notified after each source of a batch finishes.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn source_finished(&self, done: usize, total: usize, result: &ScrapeResult);
}

pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn source_finished(&self, _done: usize, _total: usize, _result: &ScrapeResult) {}
}

/// Runs per-source configs one after another, never in parallel.
#[derive(Clone)]
pub struct ScraperManager {
    runner: Arc<dyn SourceRunner>,
}

impl ScraperManager {
    pub fn new(runner: Arc<dyn SourceRunner>) -> Self {
        Self { runner }
    }

    pub async fn scrape_all(&self, configs: &[ScraperConfig]) -> Vec<ScrapeResult> {
        self.scrape_all_with_progress(configs, &NoProgress).await
    }

    /// One result per config, in input order. A fatal failure in one source never stops the rest.
    pub async fn scrape_all_with_progress(
        &self,
        configs: &[ScraperConfig],
        progress: &dyn ProgressSink,
    ) -> Vec<ScrapeResult> {
        let total = configs.len();
        let mut results = Vec::with_capacity(total);

        for (index, config) in configs.iter().enumerate() {
            let start = Utc::now();
            info!(source = %config.source, position = index + 1, total, "running source");
            let result = match self.runner.run_source(config).await {
                Ok(result) => result,
                Err(err) => {
                    error!(source = %config.source, error = %format!("{err:#}"), "source failed fatally");
                    ScrapeResult::failed(config.source, start, format!("{err:#}"))
                }
            };
            progress.source_finished(index + 1, total, &result).await;
            results.push(result);
        }

        log_summary(&results);
        results
    }
}

fn log_summary(results: &[ScrapeResult]) {
    for result in results {
        if result.success {
            info!(
                source = %result.source,
                properties = result.properties_scraped,
                errors = result.errors.len(),
                duration_ms = result.duration_ms,
                "source summary"
            );
        } else {
            warn!(
                source = %result.source,
                properties = result.properties_scraped,
                errors = %result.errors.join("; "),
                "source summary (failed)"
            );
        }
    }
    let total: usize = results.iter().map(|r| r.properties_scraped).sum();
    let ok = results.iter().filter(|r| r.success).count();
    info!(sources = results.len(), successful = ok, properties = total, "scrape batch finished");
}
