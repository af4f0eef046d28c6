//! Per-source listing extractors, the record validator and the per-source scraper run.

use chrono::{DateTime, Utc};
use estate_core::{ScrapedListing, ScraperConfig, SourceId};
use estate_storage::{content_digest, FetchError};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

mod mubawab;
pub mod scrape;
mod tayara;
mod tunisie_annonce;
pub mod validation;

pub use scrape::{pacing_delay, SourceScraper};
pub use validation::{filter_valid, validate, FilterOutcome, ValidationOutcome};

pub const CRATE_NAME: &str = "estate-adapters";

pub const MIN_PRICE: f64 = 1_000.0;
pub const MAX_PRICE: f64 = 100_000_000.0;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Raw fields read off a listing card or detail page, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCandidate {
    pub href: String,
    pub listing_id: String,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub size_text: Option<String>,
    pub location_text: Option<String>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub floor: Option<i32>,
    pub property_type: Option<String>,
    pub transaction_type: Option<String>,
    pub contact_phone: Option<String>,
}

impl RawCandidate {
    /// Fill fields the listing card did not expose from a detail-page candidate.
    pub fn merge_detail(&mut self, detail: RawCandidate) {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.title, detail.title);
        fill(&mut self.price_text, detail.price_text);
        fill(&mut self.size_text, detail.size_text);
        fill(&mut self.location_text, detail.location_text);
        fill(&mut self.description, detail.description);
        fill(&mut self.bedrooms, detail.bedrooms);
        fill(&mut self.bathrooms, detail.bathrooms);
        fill(&mut self.floor, detail.floor);
        fill(&mut self.property_type, detail.property_type);
        fill(&mut self.transaction_type, detail.transaction_type);
        fill(&mut self.contact_phone, detail.contact_phone);
        for image in detail.images {
            if !self.images.contains(&image) {
                self.images.push(image);
            }
        }
    }
}

/// One category of a crawl: a governorate/property-type slice of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTarget {
    pub label: String,
    pub governorate: Option<String>,
    pub property_type: Option<String>,
    /// Uppercased property types to keep when the listing page mixes types.
    pub type_filter: Vec<String>,
    /// Place names to keep when the listing page mixes areas.
    pub area_filter: Vec<String>,
}

impl CrawlTarget {
    pub fn all(label: &str) -> Self {
        Self {
            label: label.to_string(),
            governorate: None,
            property_type: None,
            type_filter: Vec::new(),
            area_filter: Vec::new(),
        }
    }

    /// Apply the page-level filters; listings without a location pass the area filter.
    pub fn accepts(&self, listing: &ScrapedListing) -> bool {
        let type_ok = self.type_filter.is_empty()
            || listing
                .property_type
                .as_deref()
                .is_some_and(|t| self.type_filter.iter().any(|f| f.eq_ignore_ascii_case(t)));

        let places = [
            listing.governorate.as_deref(),
            listing.delegation.as_deref(),
            listing.neighborhood.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        let area_ok = self.area_filter.is_empty()
            || places.is_empty()
            || places
                .iter()
                .any(|p| self.area_filter.iter().any(|f| f.eq_ignore_ascii_case(p)));

        type_ok && area_ok
    }
}

/// Site-specific extraction, dispatched on the closed source set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extractor {
    source: SourceId,
}

pub fn extractor_for(source: SourceId) -> Extractor {
    Extractor { source }
}

impl Extractor {
    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn crawl_plan(&self, config: &ScraperConfig) -> Vec<CrawlTarget> {
        match self.source {
            SourceId::Tayara => tayara::crawl_plan(config),
            SourceId::Mubawab => mubawab::crawl_plan(config),
            SourceId::TunisieAnnonce => tunisie_annonce::crawl_plan(config),
        }
    }

    /// Listing page URLs to try in order; later entries are fallbacks for an empty first page.
    pub fn page_urls(&self, target: &CrawlTarget, page: u32) -> Vec<String> {
        match self.source {
            SourceId::Tayara => tayara::page_urls(page),
            SourceId::Mubawab => mubawab::page_urls(target, page),
            SourceId::TunisieAnnonce => tunisie_annonce::page_urls(page),
        }
    }

    /// Candidates on one listing page, deduplicated by link.
    pub fn extract_listing_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<RawCandidate>, AdapterError> {
        let document = Html::parse_document(html);
        let candidates = match self.source {
            SourceId::Tayara => tayara::extract_listing_page(&document, page_url)?,
            SourceId::Mubawab => mubawab::extract_listing_page(&document, page_url)?,
            SourceId::TunisieAnnonce => tunisie_annonce::extract_listing_page(&document, page_url)?,
        };
        Ok(dedup_by_href(candidates))
    }

    pub fn extract_detail(&self, html: &str, page_url: &str) -> Result<RawCandidate, AdapterError> {
        let document = Html::parse_document(html);
        match self.source {
            SourceId::Tayara => tayara::extract_detail(&document, page_url),
            SourceId::Mubawab => mubawab::extract_detail(&document, page_url),
            SourceId::TunisieAnnonce => tunisie_annonce::extract_detail(&document, page_url),
        }
    }

    /// Whether a listing without a parsed price must be dropped.
    pub fn price_required(&self) -> bool {
        matches!(self.source, SourceId::TunisieAnnonce)
    }

    /// Normalize a candidate into a listing with source defaults applied.
    pub fn build_listing(
        &self,
        candidate: &RawCandidate,
        target: &CrawlTarget,
        scraped_at: DateTime<Utc>,
    ) -> ScrapedListing {
        let mut listing =
            ScrapedListing::new(self.source, &candidate.href, &candidate.listing_id, scraped_at);
        listing.title = candidate.title.clone();
        listing.description = candidate.description.clone();
        listing.price = candidate.price_text.as_deref().and_then(parse_price);

        let size_source = candidate
            .size_text
            .iter()
            .chain(candidate.title.iter())
            .chain(candidate.description.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        listing.size = parse_size(&size_source);

        let room_source = [candidate.title.as_deref(), candidate.description.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        listing.bedrooms = candidate.bedrooms.or_else(|| parse_bedrooms(&room_source));
        listing.bathrooms = candidate.bathrooms.or_else(|| parse_bathrooms(&room_source));
        listing.floor = candidate.floor.or_else(|| parse_floor(&room_source));

        if let Some(location) = candidate.location_text.as_deref() {
            let parts = split_location(location);
            listing.governorate = parts.governorate;
            listing.delegation = parts.delegation;
            listing.neighborhood = parts.neighborhood;
        }
        if listing.governorate.is_none() {
            listing.governorate = target.governorate.clone();
        }

        listing.images = filter_images(self.source, &candidate.images);
        listing.contact_phone = candidate.contact_phone.clone();

        listing.property_type = candidate
            .property_type
            .clone()
            .or_else(|| target.property_type.as_ref().map(|t| t.to_uppercase()))
            .or_else(|| Some("APARTMENT".to_string()));
        listing.transaction_type = candidate
            .transaction_type
            .clone()
            .or_else(|| Some("SALE".to_string()));

        apply_amenities(&mut listing);
        enrich_metadata(&mut listing);
        listing
    }
}

fn dedup_by_href(candidates: Vec<RawCandidate>) -> Vec<RawCandidate> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| !c.href.is_empty() && seen.insert(c.href.clone()))
        .collect()
}

lazy_static! {
    static ref PRICE_RUN: Regex = Regex::new(r"\d(?:[\d.,\s\u{a0}\u{202f}]*\d)?").unwrap();
    static ref SIZE: Regex = Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*m(?:²|2)").unwrap();
    static ref BEDROOMS_S_PLUS: Regex = Regex::new(r"(?i)\bS\s*\+\s*(\d{1,2})").unwrap();
    static ref BEDROOMS_WORD: Regex = Regex::new(r"(?i)(\d{1,2})\s*chambres?").unwrap();
    static ref BATHROOMS: Regex =
        Regex::new(r"(?i)(\d{1,2})\s*salles?\s*(?:de\s*bains?|d'eau|d’eau)").unwrap();
    static ref FLOOR: Regex =
        Regex::new(r"(?i)(?:étage|etage)\s*:?\s*(\d{1,2})|(\d{1,2})\s*(?:er|ère|ème|e)\s*(?:étage|etage)")
            .unwrap();
    static ref PHONE: Regex = Regex::new(r"\+?216[\s-]?\d{2}[\s-]?\d{3}[\s-]?\d{3}").unwrap();
}

/// First numeric run of a price text, with separators removed, accepted only within the price band.
pub fn parse_price(text: &str) -> Option<f64> {
    let run = PRICE_RUN.find(text)?;
    let digits = run
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    let value = digits.parse::<u64>().ok()? as f64;
    (MIN_PRICE..=MAX_PRICE).contains(&value).then_some(value)
}

pub fn parse_size(text: &str) -> Option<f64> {
    let caps = SIZE.captures(text)?;
    caps.get(1)?.as_str().replace(',', ".").parse().ok()
}

pub fn parse_bedrooms(text: &str) -> Option<i32> {
    BEDROOMS_S_PLUS
        .captures(text)
        .or_else(|| BEDROOMS_WORD.captures(text))
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}

pub fn parse_bathrooms(text: &str) -> Option<i32> {
    BATHROOMS
        .captures(text)
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}

pub fn parse_floor(text: &str) -> Option<i32> {
    let caps = FLOOR.captures(text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn parse_phone(text: &str) -> Option<String> {
    PHONE.find(text).map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationParts {
    pub governorate: Option<String>,
    pub delegation: Option<String>,
    pub neighborhood: Option<String>,
}

/// `"Neighborhood, Delegation, Governorate"`; the last part is always the governorate.
pub fn split_location(text: &str) -> LocationParts {
    let parts = text
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    let n = parts.len();
    LocationParts {
        governorate: parts.last().map(|s| s.to_string()),
        delegation: (n >= 2).then(|| parts[n - 2].to_string()),
        neighborhood: (n >= 3).then(|| parts[0].to_string()),
    }
}

/// Keep only the source's real listing photos, deduplicated and capped.
pub fn filter_images(source: SourceId, urls: &[String]) -> Vec<String> {
    let marker = source.media_marker();
    let mut kept: Vec<String> = Vec::new();
    for url in urls {
        let url = url.trim();
        if !url.starts_with("http") || !url.contains(marker) {
            continue;
        }
        if !kept.iter().any(|k| k == url) {
            kept.push(url.to_string());
        }
        if kept.len() == source.max_images() {
            break;
        }
    }
    kept
}

const AMENITY_KEYWORDS: [(&str, &[&str]); 6] = [
    ("parking", &["parking", "garage"]),
    ("elevator", &["ascenseur", "elevator"]),
    ("pool", &["piscine", "pool"]),
    ("garden", &["jardin", "garden"]),
    ("sea_view", &["vue mer", "vue sur mer", "sea view"]),
    ("furnished", &["meublé", "meuble", "furnished"]),
];

pub fn apply_amenities(listing: &mut ScrapedListing) {
    let text = format!(
        "{} {}",
        listing.title.as_deref().unwrap_or_default(),
        listing.description.as_deref().unwrap_or_default()
    )
    .to_lowercase();
    for (flag, keywords) in AMENITY_KEYWORDS {
        if !keywords.iter().any(|k| text.contains(k)) {
            continue;
        }
        match flag {
            "parking" => listing.has_parking = true,
            "elevator" => listing.has_elevator = true,
            "pool" => listing.has_pool = true,
            "garden" => listing.has_garden = true,
            "sea_view" => listing.has_sea_view = true,
            _ => listing.is_furnished = true,
        }
    }
}

/// Derived fields: price per m², completeness percentage and a change-detection hash.
pub fn enrich_metadata(listing: &mut ScrapedListing) {
    listing.price_per_m2 = match (listing.price, listing.size) {
        (Some(price), Some(size)) if size > 0.0 => Some((price / size * 100.0).round() / 100.0),
        _ => None,
    };

    let filled = [
        listing.title.is_some(),
        listing.description.is_some(),
        listing.price.is_some(),
        listing.size.is_some(),
        listing.bedrooms.is_some(),
        listing.bathrooms.is_some(),
        listing.governorate.is_some(),
        listing.delegation.is_some(),
        listing.neighborhood.is_some(),
        !listing.images.is_empty(),
        listing.contact_phone.is_some(),
    ];
    let count = filled.iter().filter(|f| **f).count() as f64;
    listing.completeness_score = (count / filled.len() as f64 * 1000.0).round() / 10.0;

    let fingerprint = format!(
        "{}|{}|{}|{}|{}",
        listing.title.as_deref().unwrap_or_default(),
        listing.price.map(|p| p.to_string()).unwrap_or_default(),
        listing.size.map(|s| s.to_string()).unwrap_or_default(),
        listing.governorate.as_deref().unwrap_or_default(),
        listing.neighborhood.as_deref().unwrap_or_default(),
    );
    listing.content_hash = Some(content_digest(fingerprint.as_bytes()));
}

pub(crate) fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).find_map(element_text)
}

pub(crate) fn select_document_text(document: &Html, sel: &Selector) -> Option<String> {
    document.select(sel).find_map(element_text)
}

pub(crate) fn select_all_attrs(scope: ElementRef<'_>, sel: &Selector, attrs: &[&str]) -> Vec<String> {
    scope
        .select(sel)
        .filter_map(|node| attrs.iter().find_map(|a| node.value().attr(a)))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect()
}

/// Resolve `href` against the page it was found on, dropping any fragment.
pub(crate) fn absolutize(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let mut url = base.join(href.trim()).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}
