//! Core domain model for the listing scrape and ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "estate-core";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
pub const DEFAULT_MAX_PAGES: u32 = 5;
pub const DEFAULT_DELAY_MIN_MS: u64 = 2_000;
pub const DEFAULT_DELAY_MAX_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source `{0}` (expected tayara, mubawab or tunisie-annonce)")]
pub struct UnknownSource(pub String);

/// Closed set of listing sites the pipeline knows how to crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceId {
    #[serde(rename = "tayara")]
    Tayara,
    #[serde(rename = "mubawab")]
    Mubawab,
    #[serde(rename = "tunisie-annonce")]
    TunisieAnnonce,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Tayara, SourceId::Mubawab, SourceId::TunisieAnnonce];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Tayara => "tayara",
            SourceId::Mubawab => "mubawab",
            SourceId::TunisieAnnonce => "tunisie-annonce",
        }
    }

    /// Value written to `ScrapedListing::source_website`.
    pub fn website(&self) -> &'static str {
        match self {
            SourceId::Tayara => "tayara.tn",
            SourceId::Mubawab => "mubawab.tn",
            SourceId::TunisieAnnonce => "tunisieannonce.com",
        }
    }

    /// Path fragment every genuine listing photo URL of this source contains.
    pub fn media_marker(&self) -> &'static str {
        match self {
            SourceId::Tayara => "mediaGateway",
            SourceId::Mubawab => "mubawab-media.com",
            SourceId::TunisieAnnonce => "/upload2/",
        }
    }

    pub fn max_images(&self) -> usize {
        match self {
            SourceId::TunisieAnnonce => 10,
            _ => 5,
        }
    }

    pub fn from_website(website: &str) -> Option<Self> {
        let website = website.trim().trim_start_matches("www.");
        Self::ALL.into_iter().find(|source| {
            source.website() == website
                || (*source == SourceId::TunisieAnnonce && website == "tunisie-annonce.com")
        })
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tayara" => Ok(SourceId::Tayara),
            "mubawab" => Ok(SourceId::Mubawab),
            "tunisie-annonce" | "tunisie_annonce" => Ok(SourceId::TunisieAnnonce),
            _ => Err(UnknownSource(s.to_string())),
        }
    }
}

/// One listing as produced by extraction and written to bronze files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub source_url: String,
    pub listing_id: String,
    pub source_website: String,

    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub transaction_type: Option<String>,

    #[serde(default)]
    pub governorate: Option<String>,
    #[serde(default)]
    pub delegation: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,

    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default = "default_size_unit")]
    pub size_unit: String,
    #[serde(default)]
    pub bedrooms: Option<i32>,
    #[serde(default)]
    pub bathrooms: Option<i32>,
    #[serde(default)]
    pub floor: Option<i32>,

    #[serde(default)]
    pub has_parking: bool,
    #[serde(default)]
    pub has_elevator: bool,
    #[serde(default)]
    pub has_pool: bool,
    #[serde(default)]
    pub has_garden: bool,
    #[serde(default)]
    pub has_sea_view: bool,
    #[serde(default)]
    pub is_furnished: bool,

    #[serde(default)]
    pub images: Vec<String>,

    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,

    #[serde(default)]
    pub listing_date: Option<DateTime<Utc>>,
    pub scrape_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub price_per_m2: Option<f64>,
    #[serde(default)]
    pub completeness_score: f64,
    #[serde(default)]
    pub content_hash: Option<String>,
}

fn default_currency() -> String {
    "TND".to_string()
}

fn default_size_unit() -> String {
    "m2".to_string()
}

impl ScrapedListing {
    pub fn new(
        source: SourceId,
        source_url: impl Into<String>,
        listing_id: impl Into<String>,
        scrape_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            listing_id: listing_id.into(),
            source_website: source.website().to_string(),
            title: None,
            description: None,
            price: None,
            currency: default_currency(),
            property_type: None,
            transaction_type: None,
            governorate: None,
            delegation: None,
            neighborhood: None,
            latitude: None,
            longitude: None,
            size: None,
            size_unit: default_size_unit(),
            bedrooms: None,
            bathrooms: None,
            floor: None,
            has_parking: false,
            has_elevator: false,
            has_pool: false,
            has_garden: false,
            has_sea_view: false,
            is_furnished: false,
            images: Vec::new(),
            contact_name: None,
            contact_phone: None,
            contact_email: None,
            listing_date: None,
            scrape_timestamp,
            price_per_m2: None,
            completeness_score: 0.0,
            content_hash: None,
        }
    }

    /// Numeric value of the site-local id, when it is purely numeric.
    pub fn listing_id_number(&self) -> Option<i64> {
        self.listing_id.trim().parse().ok()
    }

    pub fn source(&self) -> Option<SourceId> {
        SourceId::from_website(&self.source_website)
    }
}

/// Per-run scraper configuration. Built once per invocation and not mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperConfig {
    pub source: SourceId,
    #[serde(default)]
    pub governorates: Vec<String>,
    #[serde(default)]
    pub property_types: Vec<String>,
    pub max_pages: u32,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub user_agent: String,
}

impl ScraperConfig {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            governorates: Vec::new(),
            property_types: Vec::new(),
            max_pages: DEFAULT_MAX_PAGES,
            delay_min_ms: DEFAULT_DELAY_MIN_MS,
            delay_max_ms: DEFAULT_DELAY_MAX_MS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_scope(mut self, governorates: Vec<String>, property_types: Vec<String>) -> Self {
        self.governorates = governorates;
        self.property_types = property_types;
        self
    }

    pub fn with_delays(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.delay_min_ms = min_ms.min(max_ms);
        self.delay_max_ms = max_ms.max(min_ms);
        self
    }
}

/// Summary of one per-source scraper run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub source: SourceId,
    pub success: bool,
    pub properties_scraped: usize,
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub file_path: Option<String>,
}

impl ScrapeResult {
    /// Result for a source whose run aborted before producing anything.
    pub fn failed(source: SourceId, start_time: DateTime<Utc>, message: impl fmt::Display) -> Self {
        let end_time = Utc::now();
        Self {
            source,
            success: false,
            properties_scraped: 0,
            errors: vec![format!("Fatal error: {message}")],
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Broker ordering value; lower is dequeued first.
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::High => 1,
            JobPriority::Normal => 5,
            JobPriority::Low => 10,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            v if v <= 1 => JobPriority::High,
            v if v >= 10 => JobPriority::Low,
            _ => JobPriority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Full,
    #[default]
    Incremental,
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(RunType::Full),
            "incremental" => Ok(RunType::Incremental),
            other => Err(format!("unknown run type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Scheduled,
    #[default]
    Manual,
    Api,
}

/// Submission shape accepted by the queue; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeJobRequest {
    #[serde(default)]
    pub sources: Option<Vec<SourceId>>,
    #[serde(default, rename = "type")]
    pub run_type: Option<RunType>,
    #[serde(default)]
    pub governorates: Option<Vec<String>>,
    #[serde(default)]
    pub property_types: Option<Vec<String>>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub trigger: Option<JobTrigger>,
    #[serde(default)]
    pub schedule_id: Option<String>,
}

impl ScrapeJobRequest {
    /// Resolve defaults: all sources, incremental, 5 pages, normal priority, manual trigger.
    pub fn into_job_data(self) -> ScrapeJobData {
        let sources = match self.sources {
            Some(sources) if !sources.is_empty() => sources,
            _ => SourceId::ALL.to_vec(),
        };
        ScrapeJobData {
            sources,
            run_type: self.run_type.unwrap_or_default(),
            governorates: self.governorates.unwrap_or_default(),
            property_types: self.property_types.unwrap_or_default(),
            max_pages: self.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1),
            priority: self.priority.unwrap_or_default(),
            trigger: self.trigger.unwrap_or_default(),
            schedule_id: self.schedule_id,
        }
    }
}

/// Fully resolved queue payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeJobData {
    pub sources: Vec<SourceId>,
    #[serde(rename = "type")]
    pub run_type: RunType,
    #[serde(default)]
    pub governorates: Vec<String>,
    #[serde(default)]
    pub property_types: Vec<String>,
    pub max_pages: u32,
    pub priority: JobPriority,
    pub trigger: JobTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}

impl ScrapeJobData {
    /// One scraper config per requested source, in request order.
    pub fn scraper_configs(&self, template: &ScraperConfig) -> Vec<ScraperConfig> {
        self.sources
            .iter()
            .map(|source| ScraperConfig {
                source: *source,
                governorates: self.governorates.clone(),
                property_types: self.property_types.clone(),
                max_pages: self.max_pages,
                ..template.clone()
            })
            .collect()
    }
}

/// Aggregate result returned by the scrape job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: Uuid,
    pub success: bool,
    pub results: Vec<ScrapeResult>,
    pub total_properties_scraped: usize,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn aggregate(job_id: Uuid, results: Vec<ScrapeResult>) -> Self {
        let success = results.iter().all(|r| r.success);
        let total_properties_scraped = results.iter().map(|r| r.properties_scraped).sum();
        let errors = results
            .iter()
            .filter(|r| !r.success)
            .flat_map(|r| r.errors.iter().map(move |e| format!("{}: {e}", r.source)))
            .collect();
        Self {
            job_id,
            success,
            results,
            total_properties_scraped,
            errors,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }
}

/// Stored listing lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListingStatus {
    Active,
    Pending,
    Inactive,
    Sold,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "ACTIVE",
            ListingStatus::Pending => "PENDING",
            ListingStatus::Inactive => "INACTIVE",
            ListingStatus::Sold => "SOLD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(ListingStatus::Active),
            "PENDING" => Some(ListingStatus::Pending),
            "INACTIVE" => Some(ListingStatus::Inactive),
            "SOLD" => Some(ListingStatus::Sold),
            _ => None,
        }
    }

    /// Statuses the reconciliation sweep re-probes.
    pub fn is_active_like(&self) -> bool {
        matches!(self, ListingStatus::Active | ListingStatus::Pending)
    }
}
