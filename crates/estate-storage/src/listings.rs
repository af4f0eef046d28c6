//! Canonical listing store shared by ingestion and reconciliation.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::ListingStatus;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: Uuid,
    pub source_url: Option<String>,
    pub source: String,
    pub listing_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub property_type: String,
    pub transaction_type: String,
    pub governorate: Option<String>,
    pub delegation: Option<String>,
    pub neighborhood: Option<String>,
    pub size: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub images: Vec<String>,
    pub content_hash: Option<String>,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationCandidate {
    pub id: Uuid,
    pub source_url: String,
    pub status: ListingStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// A row with the same `source_url` already exists.
    Duplicate(Uuid),
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_source_url(&self, source_url: &str) -> anyhow::Result<Option<Uuid>>;

    async fn find_by_title_location(
        &self,
        title: &str,
        governorate: Option<&str>,
        delegation: Option<&str>,
        neighborhood: Option<&str>,
    ) -> anyhow::Result<Option<Uuid>>;

    /// Insert keyed by `source_url`; an existing row wins.
    async fn insert(&self, listing: &StoredListing) -> anyhow::Result<InsertOutcome>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<StoredListing>>;

    /// Active-like rows with a source URL, least recently updated first.
    async fn reconciliation_candidates(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ReconciliationCandidate>>;

    async fn update_status(&self, id: Uuid, status: ListingStatus) -> anyhow::Result<()>;

    async fn delete(&self, id: Uuid) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: RwLock<Vec<StoredListing>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<StoredListing>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub async fn snapshot(&self) -> Vec<StoredListing> {
        self.rows.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn find_by_source_url(&self, source_url: &str) -> anyhow::Result<Option<Uuid>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|row| row.source_url.as_deref() == Some(source_url))
            .map(|row| row.id))
    }

    async fn find_by_title_location(
        &self,
        title: &str,
        governorate: Option<&str>,
        delegation: Option<&str>,
        neighborhood: Option<&str>,
    ) -> anyhow::Result<Option<Uuid>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|row| {
                row.title == title
                    && row.governorate.as_deref() == governorate
                    && row.delegation.as_deref() == delegation
                    && row.neighborhood.as_deref() == neighborhood
            })
            .map(|row| row.id))
    }

    async fn insert(&self, listing: &StoredListing) -> anyhow::Result<InsertOutcome> {
        let mut rows = self.rows.write().await;
        if let Some(url) = listing.source_url.as_deref() {
            if let Some(existing) = rows.iter().find(|r| r.source_url.as_deref() == Some(url)) {
                return Ok(InsertOutcome::Duplicate(existing.id));
            }
        }
        rows.push(listing.clone());
        Ok(InsertOutcome::Inserted(listing.id))
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<StoredListing>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().find(|row| row.id == id).cloned())
    }

    async fn reconciliation_candidates(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ReconciliationCandidate>> {
        let rows = self.rows.read().await;
        let mut candidates = rows
            .iter()
            .filter(|row| row.status.is_active_like())
            .filter_map(|row| {
                row.source_url.as_ref().map(|url| ReconciliationCandidate {
                    id: row.id,
                    source_url: url.clone(),
                    status: row.status,
                    updated_at: row.updated_at,
                })
            })
            .collect::<Vec<_>>();
        candidates.sort_by_key(|c| c.updated_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn update_status(&self, id: Uuid, status: ListingStatus) -> anyhow::Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .with_context(|| format!("listing {id} not found"))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<()> {
        self.rows.write().await.retain(|row| row.id != id);
        Ok(())
    }
}

/// Postgres-backed store over the `listings` table (see `migrations/`).
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const LISTING_COLUMNS: &str = "id, source_url, source, listing_id, title, description, price, \
     currency, property_type, transaction_type, governorate, delegation, neighborhood, size, \
     bedrooms, bathrooms, images, content_hash, status, created_at, updated_at";

fn listing_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<StoredListing> {
    let status: String = row.try_get("status")?;
    let images: serde_json::Value = row.try_get("images")?;
    Ok(StoredListing {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        source: row.try_get("source")?,
        listing_id: row.try_get("listing_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        property_type: row.try_get("property_type")?,
        transaction_type: row.try_get("transaction_type")?,
        governorate: row.try_get("governorate")?,
        delegation: row.try_get("delegation")?,
        neighborhood: row.try_get("neighborhood")?,
        size: row.try_get("size")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        images: serde_json::from_value(images).context("decoding listing images")?,
        content_hash: row.try_get("content_hash")?,
        status: ListingStatus::parse(&status)
            .with_context(|| format!("unknown listing status {status}"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn find_by_source_url(&self, source_url: &str) -> anyhow::Result<Option<Uuid>> {
        let row = sqlx::query("SELECT id FROM listings WHERE source_url = $1 LIMIT 1")
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await
            .context("looking up listing by source_url")?;
        row.map(|r| r.try_get::<Uuid, _>("id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn find_by_title_location(
        &self,
        title: &str,
        governorate: Option<&str>,
        delegation: Option<&str>,
        neighborhood: Option<&str>,
    ) -> anyhow::Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM listings
            WHERE title = $1
              AND governorate IS NOT DISTINCT FROM $2
              AND delegation IS NOT DISTINCT FROM $3
              AND neighborhood IS NOT DISTINCT FROM $4
            LIMIT 1
            "#,
        )
        .bind(title)
        .bind(governorate)
        .bind(delegation)
        .bind(neighborhood)
        .fetch_optional(&self.pool)
        .await
        .context("looking up listing by title and location")?;
        row.map(|r| r.try_get::<Uuid, _>("id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn insert(&self, listing: &StoredListing) -> anyhow::Result<InsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO listings (
                id, source_url, source, listing_id, title, description, price, currency,
                property_type, transaction_type, governorate, delegation, neighborhood, size,
                bedrooms, bathrooms, images, content_hash, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT (source_url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(listing.id)
        .bind(&listing.source_url)
        .bind(&listing.source)
        .bind(&listing.listing_id)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.price)
        .bind(&listing.currency)
        .bind(&listing.property_type)
        .bind(&listing.transaction_type)
        .bind(&listing.governorate)
        .bind(&listing.delegation)
        .bind(&listing.neighborhood)
        .bind(listing.size)
        .bind(listing.bedrooms)
        .bind(listing.bathrooms)
        .bind(serde_json::to_value(&listing.images)?)
        .bind(&listing.content_hash)
        .bind(listing.status.as_str())
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("inserting listing")?;

        match inserted {
            Some(row) => Ok(InsertOutcome::Inserted(row.try_get("id")?)),
            None => {
                let url = listing.source_url.as_deref().unwrap_or_default();
                let existing = self
                    .find_by_source_url(url)
                    .await?
                    .with_context(|| format!("conflicting listing for {url} vanished"))?;
                Ok(InsertOutcome::Duplicate(existing))
            }
        }
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<StoredListing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("loading listing")?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn reconciliation_candidates(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ReconciliationCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_url, status, updated_at
            FROM listings
            WHERE status IN ('ACTIVE', 'PENDING')
              AND source_url IS NOT NULL
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("selecting reconciliation candidates")?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(ReconciliationCandidate {
                    id: row.try_get("id")?,
                    source_url: row.try_get("source_url")?,
                    status: ListingStatus::parse(&status)
                        .with_context(|| format!("unknown listing status {status}"))?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn update_status(&self, id: Uuid, status: ListingStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE listings SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("updating status of listing {id}"))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM listings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting listing {id}"))?;
        Ok(())
    }
}
