//! Source-sync agent: re-probe stored listings and retire the ones gone from their origin site.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use estate_core::ListingStatus;
use estate_storage::{FetchError, HttpClientConfig, HttpFetcher, ListingStore, ReconciliationCandidate};
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DETAILS_CAP: usize = 20;
pub const PROBE_BODY_LIMIT: usize = 200_000;
pub const PROBE_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const DEFAULT_PATTERNS: &[(&str, bool)] = &[
    (r"vendu", true),
    (r"sold\s*out", true),
    (r"n['’]est\s+plus\s+disponible", false),
    (r"plus\s+disponible", false),
    (r"annonce\s+indisponible", false),
    (r"cette\s+annonce\s+n['’]existe\s+plus", false),
    (r"désactivée", false),
    (r"supprimée", false),
    (r"deleted", false),
    (r"expired", false),
    (r"not\s+found", false),
];

/// Case-insensitive page-text pattern meaning the listing is gone.
#[derive(Debug, Clone)]
pub struct SoldPattern {
    regex: Regex,
    /// A match means sold rather than merely unavailable.
    pub sale: bool,
}

impl SoldPattern {
    pub fn new(pattern: &str, sale: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self { regex, sale })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

lazy_static! {
    static ref DEFAULT_SOLD_PATTERNS: Vec<SoldPattern> = DEFAULT_PATTERNS
        .iter()
        .map(|(pattern, sale)| SoldPattern::new(pattern, *sale).unwrap())
        .collect();
}

pub fn default_sold_patterns() -> Vec<SoldPattern> {
    DEFAULT_SOLD_PATTERNS.clone()
}

/// Rules file format understood by `load_sold_patterns`.
pub const PATTERN_RULES_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct PatternRules {
    version: u32,
    #[serde(default)]
    patterns: Vec<PatternRule>,
}

#[derive(Debug, Deserialize)]
struct PatternRule {
    pattern: String,
    #[serde(default)]
    sale: bool,
}

/// Built-in patterns followed by the ones in a YAML rules file.
pub async fn load_sold_patterns(path: &Path) -> Result<Vec<SoldPattern>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let rules: PatternRules =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if rules.version != PATTERN_RULES_VERSION {
        bail!(
            "{}: unsupported rules version {} (expected {PATTERN_RULES_VERSION})",
            path.display(),
            rules.version
        );
    }

    let mut patterns = default_sold_patterns();
    for rule in rules.patterns {
        let pattern = SoldPattern::new(&rule.pattern, rule.sale)
            .with_context(|| format!("compiling pattern `{}` from {}", rule.pattern, path.display()))?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Live { reason: String },
    Gone { status: ListingStatus, reason: String },
}

pub fn classify_probe(response: &ProbeResponse, patterns: &[SoldPattern]) -> ProbeOutcome {
    if matches!(response.status, 404 | 410) {
        return ProbeOutcome::Gone {
            status: ListingStatus::Inactive,
            reason: format!("HTTP {}", response.status),
        };
    }
    if response.body.trim().is_empty() {
        return ProbeOutcome::Gone {
            status: ListingStatus::Inactive,
            reason: "Empty response body".to_string(),
        };
    }
    if let Some(pattern) = patterns.iter().find(|p| p.is_match(&response.body)) {
        let status = if pattern.sale {
            ListingStatus::Sold
        } else {
            ListingStatus::Inactive
        };
        return ProbeOutcome::Gone {
            status,
            reason: format!("Pattern matched: {}", pattern.as_str()),
        };
    }
    ProbeOutcome::Live {
        reason: format!("HTTP {}", response.status),
    }
}

/// Fetches a listing's origin page. Errors mean the probe itself failed.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError>;
}

pub struct HttpProber {
    fetcher: HttpFetcher,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(PROBE_USER_AGENT.to_string()),
            max_body_bytes: Some(PROBE_BODY_LIMIT),
        })?;
        Ok(Self { fetcher })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError> {
        let response = self.fetcher.get(url).await?;
        Ok(ProbeResponse {
            status: response.status.as_u16(),
            body: response.text(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    MarkInactive,
    MarkSold,
    Delete,
    WouldMarkInactive,
    WouldMarkSold,
    WouldDelete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileDetail {
    pub id: Uuid,
    pub action: ReconcileAction,
    pub reason: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    pub batch_size: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Counts cover every scanned listing; `details` stops at `DETAILS_CAP` entries.
/// In a dry run the counts describe what would have happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub dry_run: bool,
    pub delete_mode: bool,
    pub scanned: usize,
    pub unchanged: usize,
    pub marked_inactive: usize,
    pub marked_sold: usize,
    pub deleted: usize,
    pub errors: usize,
    pub details: Vec<ReconcileDetail>,
}

impl ReconcileSummary {
    fn record(&mut self, candidate: &ReconciliationCandidate, action: ReconcileAction, reason: String) {
        if self.details.len() < DETAILS_CAP {
            self.details.push(ReconcileDetail {
                id: candidate.id,
                action,
                reason,
                source_url: candidate.source_url.clone(),
            });
        }
    }
}

pub struct SourceSyncAgent {
    store: Arc<dyn ListingStore>,
    prober: Arc<dyn Prober>,
    patterns: Vec<SoldPattern>,
    delete_mode: bool,
}

impl SourceSyncAgent {
    pub fn new(store: Arc<dyn ListingStore>, prober: Arc<dyn Prober>) -> Self {
        Self {
            store,
            prober,
            patterns: default_sold_patterns(),
            delete_mode: false,
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<SoldPattern>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_delete_mode(mut self, delete_mode: bool) -> Self {
        self.delete_mode = delete_mode;
        self
    }

    pub fn delete_mode(&self) -> bool {
        self.delete_mode
    }

    pub async fn run(&self, options: ReconcileOptions) -> Result<ReconcileSummary> {
        let candidates = self
            .store
            .reconciliation_candidates(options.batch_size.max(1))
            .await
            .context("loading reconciliation candidates")?;
        info!(
            candidates = candidates.len(),
            dry_run = options.dry_run,
            delete_mode = self.delete_mode,
            "source sync started"
        );

        let mut summary = ReconcileSummary {
            dry_run: options.dry_run,
            delete_mode: self.delete_mode,
            scanned: candidates.len(),
            ..ReconcileSummary::default()
        };

        for candidate in &candidates {
            let response = match self.prober.probe(&candidate.source_url).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(listing = %candidate.id, url = %candidate.source_url, error = %err, "probe failed, listing kept");
                    summary.errors += 1;
                    summary.record(candidate, ReconcileAction::Error, err.to_string());
                    continue;
                }
            };

            let (status, reason) = match classify_probe(&response, &self.patterns) {
                ProbeOutcome::Live { reason } => {
                    debug!(listing = %candidate.id, %reason, "listing still live");
                    summary.unchanged += 1;
                    continue;
                }
                ProbeOutcome::Gone { status, reason } => (status, reason),
            };

            if let Err(err) = self.apply(candidate, status, reason, options.dry_run, &mut summary).await {
                error!(listing = %candidate.id, error = %format!("{err:#}"), "listing update failed");
                summary.errors += 1;
                summary.record(candidate, ReconcileAction::Error, format!("{err:#}"));
            }
        }

        info!(
            scanned = summary.scanned,
            unchanged = summary.unchanged,
            marked_inactive = summary.marked_inactive,
            marked_sold = summary.marked_sold,
            deleted = summary.deleted,
            errors = summary.errors,
            "source sync finished"
        );
        Ok(summary)
    }

    async fn apply(
        &self,
        candidate: &ReconciliationCandidate,
        status: ListingStatus,
        reason: String,
        dry_run: bool,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let sold = status == ListingStatus::Sold;
        let action = match (self.delete_mode, sold, dry_run) {
            (true, _, true) => ReconcileAction::WouldDelete,
            (true, _, false) => ReconcileAction::Delete,
            (false, true, true) => ReconcileAction::WouldMarkSold,
            (false, true, false) => ReconcileAction::MarkSold,
            (false, false, true) => ReconcileAction::WouldMarkInactive,
            (false, false, false) => ReconcileAction::MarkInactive,
        };

        if !dry_run {
            if self.delete_mode {
                self.store.delete(candidate.id).await?;
            } else {
                self.store.update_status(candidate.id, status).await?;
            }
        }

        match action {
            ReconcileAction::Delete | ReconcileAction::WouldDelete => summary.deleted += 1,
            ReconcileAction::MarkSold | ReconcileAction::WouldMarkSold => summary.marked_sold += 1,
            _ => summary.marked_inactive += 1,
        }
        info!(listing = %candidate.id, action = ?action, %reason, "listing reconciled");
        summary.record(candidate, action, reason);
        Ok(())
    }
}

/// Runs the agent on a cron cadence. A tick that finds the previous run still going is skipped.
pub struct ReconcileDaemon {
    agent: Arc<SourceSyncAgent>,
    options: ReconcileOptions,
    cron: String,
    inner: Option<JobScheduler>,
}

impl ReconcileDaemon {
    pub fn new(agent: Arc<SourceSyncAgent>, options: ReconcileOptions, cron: impl Into<String>) -> Self {
        Self {
            agent,
            options,
            cron: cron.into(),
            inner: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let agent = Arc::clone(&self.agent);
        let options = self.options;
        let running = Arc::new(Mutex::new(()));
        let job = Job::new_async(self.cron.as_str(), move |_uuid, _l| {
            let agent = Arc::clone(&agent);
            let running = Arc::clone(&running);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous source sync still running, tick skipped");
                    return;
                };
                if let Err(err) = agent.run(options).await {
                    error!(error = %format!("{err:#}"), "source sync run failed");
                }
            })
        })
        .with_context(|| format!("creating source sync job for cron {}", self.cron))?;
        sched.add(job).await.context("adding source sync job")?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.cron, "source sync daemon started");
        self.inner = Some(sched);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut sched) = self.inner.take() {
            sched.shutdown().await.context("stopping scheduler")?;
            info!("source sync daemon stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use estate_storage::{MemoryListingStore, StoredListing};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeProber {
        pages: HashMap<String, Result<(u16, String), String>>,
    }

    impl FakeProber {
        fn page(mut self, url: &str, status: u16, body: &str) -> Self {
            self.pages.insert(url.to_string(), Ok((status, body.to_string())));
            self
        }

        fn broken(mut self, url: &str, message: &str) -> Self {
            self.pages.insert(url.to_string(), Err(message.to_string()));
            self
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError> {
            match self.pages.get(url) {
                Some(Ok((status, body))) => Ok(ProbeResponse {
                    status: *status,
                    body: body.clone(),
                }),
                Some(Err(message)) => Err(FetchError::Browser(message.clone())),
                None => Err(FetchError::Browser(format!("no fixture for {url}"))),
            }
        }
    }

    fn listing(url: &str, age_days: i64) -> StoredListing {
        let at = Utc::now() - ChronoDuration::days(age_days);
        StoredListing {
            id: Uuid::new_v4(),
            source_url: Some(url.to_string()),
            source: "tayara".into(),
            listing_id: None,
            title: format!("Listing at {url}"),
            description: None,
            price: Some(300_000.0),
            currency: "TND".into(),
            property_type: "APARTMENT".into(),
            transaction_type: "SALE".into(),
            governorate: Some("Tunis".into()),
            delegation: None,
            neighborhood: None,
            size: Some(110.0),
            bedrooms: Some(3),
            bathrooms: None,
            images: vec![],
            content_hash: None,
            status: ListingStatus::Active,
            created_at: at,
            updated_at: at,
        }
    }

    fn fixture() -> (Arc<MemoryListingStore>, FakeProber) {
        let store = Arc::new(MemoryListingStore::with_rows(vec![
            listing("https://x/live", 5),
            listing("https://x/gone", 4),
            listing("https://x/sold", 3),
            listing("https://x/removed", 2),
            listing("https://x/empty", 1),
        ]));
        let prober = FakeProber::default()
            .page("https://x/live", 200, "<h1>Appartement S+3</h1>")
            .page("https://x/gone", 404, "")
            .page("https://x/sold", 200, "<p>Ce bien est VENDU</p>")
            .page("https://x/removed", 200, "Cette annonce n'existe plus")
            .page("https://x/empty", 200, "   \n ");
        (store, prober)
    }

    fn status_of(rows: &[StoredListing], url: &str) -> ListingStatus {
        rows.iter()
            .find(|r| r.source_url.as_deref() == Some(url))
            .map(|r| r.status)
            .expect("row")
    }

    #[test]
    fn classification_follows_status_and_patterns() {
        let patterns = default_sold_patterns();
        let probe = |status, body: &str| {
            classify_probe(
                &ProbeResponse {
                    status,
                    body: body.to_string(),
                },
                &patterns,
            )
        };

        assert!(matches!(probe(410, "whatever"), ProbeOutcome::Gone { status: ListingStatus::Inactive, .. }));
        assert!(matches!(probe(200, "Sold Out"), ProbeOutcome::Gone { status: ListingStatus::Sold, .. }));
        assert!(matches!(
            probe(200, "Annonce désactivée par l'annonceur"),
            ProbeOutcome::Gone { status: ListingStatus::Inactive, .. }
        ));
        assert!(matches!(probe(301, "<html>ok</html>"), ProbeOutcome::Live { .. }));
    }

    #[tokio::test]
    async fn live_run_marks_gone_listings() {
        let (store, prober) = fixture();
        let agent = SourceSyncAgent::new(store.clone(), Arc::new(prober));

        let summary = agent.run(ReconcileOptions::default()).await.expect("run");

        assert_eq!(summary.scanned, 5);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.marked_sold, 1);
        assert_eq!(summary.marked_inactive, 3);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.details.len(), 4);
        assert_eq!(summary.details[0].action, ReconcileAction::MarkInactive);
        assert_eq!(summary.details[0].reason, "HTTP 404");

        let rows = store.snapshot().await;
        assert_eq!(status_of(&rows, "https://x/live"), ListingStatus::Active);
        assert_eq!(status_of(&rows, "https://x/gone"), ListingStatus::Inactive);
        assert_eq!(status_of(&rows, "https://x/sold"), ListingStatus::Sold);
        assert_eq!(status_of(&rows, "https://x/removed"), ListingStatus::Inactive);
        assert_eq!(status_of(&rows, "https://x/empty"), ListingStatus::Inactive);
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let (store, prober) = fixture();
        let before = store.snapshot().await;
        let agent = SourceSyncAgent::new(store.clone(), Arc::new(prober)).with_delete_mode(true);

        let summary = agent
            .run(ReconcileOptions {
                dry_run: true,
                batch_size: 10,
            })
            .await
            .expect("run");

        assert!(summary.dry_run);
        assert!(summary.delete_mode);
        assert_eq!(summary.details.len(), 4);
        assert!(summary
            .details
            .iter()
            .all(|d| d.action == ReconcileAction::WouldDelete));
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn probe_failure_fails_open() {
        let store = Arc::new(MemoryListingStore::with_rows(vec![listing("https://x/slow", 1)]));
        let prober = FakeProber::default().broken("https://x/slow", "operation timed out");
        let agent = SourceSyncAgent::new(store.clone(), Arc::new(prober)).with_delete_mode(true);

        let summary = agent.run(ReconcileOptions::default()).await.expect("run");

        assert_eq!(summary.errors, 1);
        assert_eq!(summary.unchanged + summary.marked_inactive + summary.marked_sold + summary.deleted, 0);
        assert_eq!(summary.details[0].action, ReconcileAction::Error);
        assert!(summary.details[0].reason.contains("operation timed out"));
        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn delete_mode_removes_rows_and_batch_is_oldest_first() {
        let (store, prober) = fixture();
        let agent = SourceSyncAgent::new(store.clone(), Arc::new(prober)).with_delete_mode(true);

        let summary = agent
            .run(ReconcileOptions {
                dry_run: false,
                batch_size: 2,
            })
            .await
            .expect("run");

        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.deleted, 1);
        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.source_url.as_deref() != Some("https://x/gone")));
    }

    #[tokio::test]
    async fn details_are_capped_but_counts_are_not() {
        let rows = (0..25).map(|i| listing(&format!("https://x/{i}"), i)).collect();
        let store = Arc::new(MemoryListingStore::with_rows(rows));
        let agent = SourceSyncAgent::new(store, Arc::new(FakeProber::default()));

        let summary = agent
            .run(ReconcileOptions {
                dry_run: true,
                batch_size: 100,
            })
            .await
            .expect("run");

        assert_eq!(summary.errors, 25);
        assert_eq!(summary.details.len(), DETAILS_CAP);
    }

    #[tokio::test]
    async fn yaml_rules_extend_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sold_patterns.yaml");
        tokio::fs::write(
            &path,
            "version: 1\npatterns:\n  - pattern: 'bien\\s+lou[ée]'\n  - pattern: 'cédé'\n    sale: true\n",
        )
        .await
        .expect("write");

        let patterns = load_sold_patterns(&path).await.expect("load");
        assert_eq!(patterns.len(), DEFAULT_PATTERNS.len() + 2);

        let outcome = classify_probe(
            &ProbeResponse {
                status: 200,
                body: "Bien LOUÉ depuis mars".into(),
            },
            &patterns,
        );
        assert!(matches!(outcome, ProbeOutcome::Gone { status: ListingStatus::Inactive, .. }));

        let bad = dir.path().join("bad.yaml");
        tokio::fs::write(&bad, "version: 1\npatterns:\n  - pattern: '(unclosed'\n")
            .await
            .expect("write");
        assert!(load_sold_patterns(&bad).await.is_err());

        let future = dir.path().join("future.yaml");
        tokio::fs::write(&future, "version: 2\npatterns:\n  - pattern: 'vendu'\n")
            .await
            .expect("write");
        let err = load_sold_patterns(&future).await.expect_err("version 2");
        assert!(format!("{err:#}").contains("unsupported rules version 2"));
    }

    #[tokio::test]
    async fn bundled_rules_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/sold_patterns.yaml");
        let patterns = load_sold_patterns(&path).await.expect("bundled rules");
        assert_eq!(patterns.len(), DEFAULT_PATTERNS.len() + 3);
        assert!(patterns.iter().any(|p| p.sale && p.is_match("Déjà vendu")));
    }
}
