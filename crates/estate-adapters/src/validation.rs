//! Authoritative record checks applied after extraction and enrichment.
//!
//! Every rule short-circuits: the first failing rule produces the only warning.

use estate_core::{ScrapedListing, SourceId};
use serde::Serialize;

use crate::{MAX_PRICE, MIN_PRICE};

pub const MAX_SIZE: f64 = 10_000.0;
pub const MAX_ROOMS: i32 = 20;
pub const MAX_NEIGHBORHOOD_CHARS: usize = 100;
pub const BREADCRUMB_MARKER: &str = "Accueil";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    fn ok() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
        }
    }

    fn reject(message: String) -> Self {
        Self {
            valid: false,
            warnings: vec![message],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub valid: Vec<ScrapedListing>,
    pub invalid_count: usize,
    pub warnings: Vec<String>,
}

fn mapping_error(listing: &ScrapedListing) -> Option<String> {
    let id = listing.listing_id_number()?;
    if let Some(size) = listing.size {
        if size == id as f64 {
            return Some(format!(
                "Data mapping error: size {size} equals listing_id {}",
                listing.listing_id
            ));
        }
    }
    let rooms = [("bedrooms", listing.bedrooms), ("bathrooms", listing.bathrooms)];
    rooms.into_iter().find_map(|(field, value)| {
        let value = value?;
        (i64::from(value) == id).then(|| {
            format!(
                "Data mapping error: {field} {value} equals listing_id {}",
                listing.listing_id
            )
        })
    })
}

/// Check one record. Pure: the same record always yields the same verdict.
pub fn validate(listing: &ScrapedListing) -> ValidationOutcome {
    if let Some(message) = mapping_error(listing) {
        return ValidationOutcome::reject(message);
    }

    if let Some(price) = listing.price {
        if !(MIN_PRICE..=MAX_PRICE).contains(&price) {
            return ValidationOutcome::reject(format!(
                "Invalid price: {price} {} (should be between {MIN_PRICE} and {MAX_PRICE})",
                listing.currency
            ));
        }
    }

    if let Some(size) = listing.size {
        if size <= 0.0 || size > MAX_SIZE {
            return ValidationOutcome::reject(format!(
                "Invalid size: {size} {} (should be between 0 and {MAX_SIZE}, likely a mapping error)",
                listing.size_unit
            ));
        }
    }

    for (field, value) in [("bedrooms", listing.bedrooms), ("bathrooms", listing.bathrooms)] {
        if let Some(value) = value {
            if !(0..=MAX_ROOMS).contains(&value) {
                return ValidationOutcome::reject(format!(
                    "Invalid {field}: {value} (should be between 0 and {MAX_ROOMS})"
                ));
            }
        }
    }

    if let Some(neighborhood) = listing.neighborhood.as_deref() {
        if neighborhood.contains(BREADCRUMB_MARKER)
            || neighborhood.contains('>')
            || neighborhood.chars().count() > MAX_NEIGHBORHOOD_CHARS
        {
            return ValidationOutcome::reject(format!(
                "Invalid neighborhood (breadcrumb artifact): {neighborhood}"
            ));
        }
    }

    if !listing.images.is_empty() {
        let Some(source) = SourceId::from_website(&listing.source_website) else {
            return ValidationOutcome::reject(format!(
                "Cannot verify images for unknown source {}",
                listing.source_website
            ));
        };
        let marker = source.media_marker();
        let bad = listing
            .images
            .iter()
            .filter(|img| !img.contains(marker))
            .count();
        if bad > 0 {
            return ValidationOutcome::reject(format!(
                "Found {bad} non-property images (not from {marker})"
            ));
        }
    }

    ValidationOutcome::ok()
}

/// Validate a batch, keeping valid records in order.
pub fn filter_valid(listings: Vec<ScrapedListing>) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for listing in listings {
        let verdict = validate(&listing);
        if verdict.valid {
            outcome.valid.push(listing);
        } else {
            outcome.invalid_count += 1;
            outcome.warnings.extend(
                verdict
                    .warnings
                    .into_iter()
                    .map(|w| format!("Property {}: {w}", listing.listing_id)),
            );
        }
    }
    outcome
}
