//! One scraper run for one source: launch, crawl pages, fetch details, validate, write bronze.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use estate_core::{ScrapeResult, ScrapedListing, ScraperConfig};
use estate_storage::{BronzeStore, Browser, BrowserOptions, PageLoader};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{extractor_for, validate, CrawlTarget, Extractor, RawCandidate};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A uniformly random wait in `[min_ms, max_ms]`.
pub fn pacing_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(fastrand::u64(min_ms..=max_ms))
}

#[derive(Clone)]
pub struct SourceScraper {
    browser: Arc<dyn Browser>,
    bronze: BronzeStore,
    navigation_timeout: Duration,
}

struct RunState {
    listings: Vec<ScrapedListing>,
    /// Every candidate URL handled this run, kept or not.
    seen_urls: HashSet<String>,
    errors: Vec<String>,
    loads: usize,
}

impl SourceScraper {
    pub fn new(browser: Arc<dyn Browser>, bronze: BronzeStore) -> Self {
        Self {
            browser,
            bronze,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
        }
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn bronze(&self) -> &BronzeStore {
        &self.bronze
    }

    /// Run one source to completion. Never returns an error: failures land in the result.
    pub async fn run(&self, config: &ScraperConfig) -> ScrapeResult {
        let span = info_span!("scrape", source = %config.source);
        self.run_inner(config).instrument(span).await
    }

    async fn run_inner(&self, config: &ScraperConfig) -> ScrapeResult {
        let start = Utc::now();
        let extractor = extractor_for(config.source);
        info!(max_pages = config.max_pages, "starting scraper");

        let options = BrowserOptions {
            user_agent: config.user_agent.clone(),
            navigation_timeout: self.navigation_timeout,
        };
        let loader = match self.browser.launch(&options).await {
            Ok(loader) => loader,
            Err(err) => {
                error!(error = %err, "browser launch failed");
                return ScrapeResult::failed(config.source, start, err);
            }
        };

        let mut state = RunState {
            listings: Vec::new(),
            seen_urls: HashSet::new(),
            errors: Vec::new(),
            loads: 0,
        };

        for target in extractor.crawl_plan(config) {
            for page in 1..=config.max_pages {
                let Some(candidates) = self
                    .load_listing_page(&extractor, loader.as_ref(), config, &target, page, &mut state)
                    .await
                else {
                    continue;
                };
                if candidates.is_empty() {
                    info!(category = %target.label, page, "no listings on page, moving on");
                    break;
                }
                info!(category = %target.label, page, found = candidates.len(), "listing page extracted");

                for candidate in candidates {
                    self.process_candidate(&extractor, loader.as_ref(), config, &target, candidate, &mut state)
                        .await;
                }
            }
        }

        loader.close().await;

        let count = state.listings.len();
        let written = self
            .bronze
            .write_json(config.source.as_str(), Utc::now(), &state.listings)
            .await;
        let end = Utc::now();
        match written {
            Ok(file) => {
                info!(
                    properties = count,
                    errors = state.errors.len(),
                    path = %file.path.display(),
                    "scraper finished"
                );
                ScrapeResult {
                    source: config.source,
                    success: true,
                    properties_scraped: count,
                    errors: state.errors,
                    start_time: start,
                    end_time: end,
                    duration_ms: (end - start).num_milliseconds(),
                    file_path: Some(file.path.display().to_string()),
                }
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "writing bronze file failed");
                let mut result = ScrapeResult::failed(config.source, start, format!("{err:#}"));
                result.properties_scraped = count;
                let mut errors = state.errors;
                errors.append(&mut result.errors);
                result.errors = errors;
                result
            }
        }
    }

    async fn pace(&self, config: &ScraperConfig, state: &mut RunState) {
        if state.loads > 0 {
            tokio::time::sleep(pacing_delay(config.delay_min_ms, config.delay_max_ms)).await;
        }
        state.loads += 1;
    }

    /// `None` when every URL for the page failed to load; the failure is recorded.
    async fn load_listing_page(
        &self,
        extractor: &Extractor,
        loader: &dyn PageLoader,
        config: &ScraperConfig,
        target: &CrawlTarget,
        page: u32,
        state: &mut RunState,
    ) -> Option<Vec<RawCandidate>> {
        let mut last_error = None;
        let mut loaded_any = false;
        for url in extractor.page_urls(target, page) {
            self.pace(config, state).await;
            let loaded = match loader.load(&url).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    debug!(url = %url, error = %err, "listing page load failed");
                    last_error = Some(err.to_string());
                    continue;
                }
            };
            loaded_any = true;
            match extractor.extract_listing_page(&loaded.html, &loaded.url) {
                Ok(candidates) if !candidates.is_empty() => return Some(candidates),
                Ok(_) => debug!(url = %url, "no listing nodes found"),
                Err(err) => last_error = Some(err.to_string()),
            }
        }

        if loaded_any && last_error.is_none() {
            return Some(Vec::new());
        }
        let message = format!(
            "Error scraping {} page {}: {}",
            target.label,
            page,
            last_error.unwrap_or_else(|| "no page URL".to_string())
        );
        warn!("{message}");
        state.errors.push(message);
        None
    }

    async fn process_candidate(
        &self,
        extractor: &Extractor,
        loader: &dyn PageLoader,
        config: &ScraperConfig,
        target: &CrawlTarget,
        mut candidate: RawCandidate,
        state: &mut RunState,
    ) {
        if !state.seen_urls.insert(candidate.href.clone()) {
            debug!(url = %candidate.href, "listing already handled this run");
            return;
        }

        self.pace(config, state).await;
        let detail = match loader.load(&candidate.href).await {
            Ok(page) => extractor
                .extract_detail(&page.html, &page.url)
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match detail {
            Ok(detail) => candidate.merge_detail(detail),
            Err(err) => {
                let message = format!("Error extracting listing {}: {err}", candidate.href);
                warn!("{message}");
                state.errors.push(message);
                return;
            }
        }

        let listing = extractor.build_listing(&candidate, target, Utc::now());
        if extractor.price_required() && listing.price.is_none() {
            let message = format!("No price found for listing {}", listing.listing_id);
            warn!("{message}");
            state.errors.push(message);
            return;
        }
        if !target.accepts(&listing) {
            debug!(url = %listing.source_url, "listing outside configured scope");
            return;
        }

        let verdict = validate(&listing);
        if !verdict.valid {
            warn!(
                listing_id = %listing.listing_id,
                reason = %verdict.warnings.join("; "),
                "listing rejected by validator"
            );
            return;
        }

        state.listings.push(listing);
    }
}
