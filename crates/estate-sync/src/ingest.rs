//! Bronze file ingestion into the canonical listing store.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use estate_core::{ListingStatus, ScrapedListing};
use estate_storage::{list_json_files, source_from_bronze_path, BronzeStore, InsertOutcome, ListingStore, StoredListing};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

const UNTITLED: &str = "Untitled Property";

/// Canonical property type for a raw scraped label. Unknown labels map to `APARTMENT`.
pub fn normalize_property_type(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return "APARTMENT";
    };
    let value = raw.trim().to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| value.contains(w));
    if has(&["villa"]) {
        "VILLA"
    } else if has(&["maison", "house"]) {
        "HOUSE"
    } else if has(&["terrain", "land"]) {
        "LAND"
    } else if has(&["bureau", "office"]) {
        "OFFICE"
    } else if has(&["commercial", "commerce", "local", "shop"]) {
        "COMMERCIAL"
    } else {
        "APARTMENT"
    }
}

/// Canonical transaction type. Unknown labels map to `SALE`.
pub fn normalize_transaction_type(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return "SALE";
    };
    let value = raw.trim().to_lowercase();
    if value == "both" {
        "BOTH"
    } else if ["rent", "location", "louer"].iter().any(|w| value.contains(w)) {
        "RENT"
    } else {
        "SALE"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub file: String,
    pub source: Option<String>,
    pub total: usize,
    pub success: usize,
    pub duplicates: usize,
    pub errors: usize,
}

pub struct Ingestor {
    store: Arc<dyn ListingStore>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    /// Ingest every `*.json` file under `dir`, in file name order.
    pub async fn ingest_dir(&self, dir: &Path) -> Result<Vec<IngestReport>> {
        let files = list_json_files(dir).await?;
        info!(dir = %dir.display(), files = files.len(), "ingesting bronze directory");
        let mut reports = Vec::with_capacity(files.len());
        for file in files {
            reports.push(self.ingest_file(&file).await?);
        }
        Ok(reports)
    }

    /// Records are processed independently; a bad record never stops the file.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        let records: Vec<Value> = BronzeStore::read_json(path).await?;
        let mut report = IngestReport {
            file: path.display().to_string(),
            source: source_from_bronze_path(path),
            total: records.len(),
            ..IngestReport::default()
        };

        for record in records {
            match self.ingest_record(record, report.source.as_deref()).await {
                Ok(true) => report.success += 1,
                Ok(false) => report.duplicates += 1,
                Err(err) => {
                    warn!(file = %report.file, error = %format!("{err:#}"), "record not ingested");
                    report.errors += 1;
                }
            }
        }

        info!(
            file = %report.file,
            total = report.total,
            success = report.success,
            duplicates = report.duplicates,
            errors = report.errors,
            "bronze file ingested"
        );
        Ok(report)
    }

    /// `Ok(true)` when inserted, `Ok(false)` when an equivalent row already exists.
    async fn ingest_record(&self, record: Value, file_source: Option<&str>) -> Result<bool> {
        let listing: ScrapedListing = serde_json::from_value(record)?;
        if listing.source_url.trim().is_empty() {
            bail!("listing {} has no source_url", listing.listing_id);
        }

        if let Some(id) = self.store.find_by_source_url(&listing.source_url).await? {
            debug!(url = %listing.source_url, existing = %id, "duplicate by source url");
            return Ok(false);
        }
        let title = listing.title.as_deref().unwrap_or(UNTITLED);
        if let Some(id) = self
            .store
            .find_by_title_location(
                title,
                listing.governorate.as_deref(),
                listing.delegation.as_deref(),
                listing.neighborhood.as_deref(),
            )
            .await?
        {
            debug!(url = %listing.source_url, existing = %id, "duplicate by title and location");
            return Ok(false);
        }

        let stored = to_stored(listing, file_source);
        match self.store.insert(&stored).await? {
            InsertOutcome::Inserted(_) => Ok(true),
            InsertOutcome::Duplicate(_) => Ok(false),
        }
    }
}

fn to_stored(listing: ScrapedListing, file_source: Option<&str>) -> StoredListing {
    let source = file_source
        .map(str::to_string)
        .or_else(|| listing.source().map(|s| s.as_str().to_string()))
        .unwrap_or_else(|| listing.source_website.clone());
    let now = Utc::now();
    StoredListing {
        id: Uuid::new_v4(),
        property_type: normalize_property_type(listing.property_type.as_deref()).to_string(),
        transaction_type: normalize_transaction_type(listing.transaction_type.as_deref()).to_string(),
        title: listing.title.unwrap_or_else(|| UNTITLED.to_string()),
        listing_id: Some(listing.listing_id).filter(|id| !id.is_empty()),
        source_url: Some(listing.source_url),
        source,
        description: listing.description,
        price: listing.price,
        currency: listing.currency,
        governorate: listing.governorate,
        delegation: listing.delegation,
        neighborhood: listing.neighborhood,
        size: listing.size,
        bedrooms: listing.bedrooms,
        bathrooms: listing.bathrooms,
        images: listing.images,
        content_hash: listing.content_hash,
        status: ListingStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::SourceId;
    use estate_storage::MemoryListingStore;
    use tempfile::tempdir;

    fn scraped(id: &str, title: &str) -> ScrapedListing {
        let mut listing = ScrapedListing::new(
            SourceId::Mubawab,
            format!("https://www.mubawab.tn/fr/a/{id}-appartement"),
            id,
            Utc::now(),
        );
        listing.title = Some(title.to_string());
        listing.price = Some(320_000.0);
        listing.property_type = Some("Appartement".into());
        listing.transaction_type = Some("à louer".into());
        listing.governorate = Some("Tunis".into());
        listing
    }

    #[test]
    fn type_labels_normalize() {
        assert_eq!(normalize_property_type(Some("Villa avec piscine")), "VILLA");
        assert_eq!(normalize_property_type(Some("maison")), "HOUSE");
        assert_eq!(normalize_property_type(Some("Terrain")), "LAND");
        assert_eq!(normalize_property_type(Some("Bureau")), "OFFICE");
        assert_eq!(normalize_property_type(Some("local commercial")), "COMMERCIAL");
        assert_eq!(normalize_property_type(Some("COMMERCIAL")), "COMMERCIAL");
        assert_eq!(normalize_property_type(Some("chalet")), "APARTMENT");
        assert_eq!(normalize_property_type(None), "APARTMENT");

        assert_eq!(normalize_transaction_type(Some("Location")), "RENT");
        assert_eq!(normalize_transaction_type(Some("BOTH")), "BOTH");
        assert_eq!(normalize_transaction_type(Some("vente")), "SALE");
        assert_eq!(normalize_transaction_type(Some("échange")), "SALE");
    }

    #[tokio::test]
    async fn bad_records_are_counted_and_the_file_continues() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mubawab_2024-03-10_101500.json");
        let records = serde_json::json!([
            scraped("8001", "Appartement S+2 Lac 2"),
            {"title": "missing everything"},
            scraped("8002", "Appartement S+2 Lac 2"),
            scraped("8003", "Villa Gammarth"),
        ]);
        tokio::fs::write(&path, serde_json::to_vec(&records).expect("json"))
            .await
            .expect("write");

        let store = Arc::new(MemoryListingStore::new());
        let report = Ingestor::new(store.clone()).ingest_file(&path).await.expect("ingest");

        assert_eq!(report.source.as_deref(), Some("mubawab"));
        assert_eq!(report.total, 4);
        assert_eq!(report.success, 2);
        // 8002 shares title and location with 8001
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.errors, 1);

        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == ListingStatus::Active));
        assert!(rows.iter().all(|r| r.transaction_type == "RENT"));
        assert_eq!(rows[0].property_type, "APARTMENT");
        assert_eq!(rows[0].source, "mubawab");
        assert_eq!(rows[0].listing_id.as_deref(), Some("8001"));
    }

    #[tokio::test]
    async fn directory_ingest_runs_files_in_name_order() {
        let dir = tempdir().expect("tempdir");
        for (name, id) in [
            ("tayara_2024-03-11_000000.json", "2"),
            ("mubawab_2024-03-10_000000.json", "1"),
        ] {
            let body = serde_json::to_vec(&vec![scraped(id, &format!("Listing {id}"))]).expect("json");
            tokio::fs::write(dir.path().join(name), body).await.expect("write");
        }
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.expect("write");

        let store = Arc::new(MemoryListingStore::new());
        let reports = Ingestor::new(store.clone()).ingest_dir(dir.path()).await.expect("ingest");

        let sources = reports.iter().map(|r| r.source.as_deref()).collect::<Vec<_>>();
        assert_eq!(sources, vec![Some("mubawab"), Some("tayara")]);
        assert_eq!(store.len().await, 2);
    }
}
