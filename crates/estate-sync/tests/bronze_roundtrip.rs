use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use estate_adapters::SourceScraper;
use estate_core::{ScraperConfig, SourceId};
use estate_storage::{BronzeStore, Browser, BrowserOptions, FetchError, LoadedPage, MemoryListingStore, PageLoader};
use estate_sync::{Ingestor, ScraperManager};
use tempfile::tempdir;

struct FixtureBrowser {
    pages: HashMap<String, String>,
}

struct FixtureLoader {
    pages: HashMap<String, String>,
}

#[async_trait]
impl Browser for FixtureBrowser {
    async fn launch(&self, _options: &BrowserOptions) -> Result<Box<dyn PageLoader>, FetchError> {
        Ok(Box::new(FixtureLoader {
            pages: self.pages.clone(),
        }))
    }
}

#[async_trait]
impl PageLoader for FixtureLoader {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError> {
        self.pages
            .get(url)
            .map(|html| LoadedPage {
                url: url.to_string(),
                status: 200,
                html: html.clone(),
            })
            .ok_or_else(|| FetchError::Browser(format!("no fixture for {url}")))
    }
}

fn tayara_fixtures() -> HashMap<String, String> {
    let listing_page = r#"<html><body>
        <article>
          <a href="/item/abc123/?utm=feed"><h2>Appartement S+2 Ariana Essoghra</h2></a>
          <span class="price">240 000 DT</span>
          <span class="location">Ariana Essoghra, Ariana</span>
        </article>
        <article>
          <a href="/item/def456/"><h2>Villa S+4 avec piscine Hammamet</h2></a>
          <span class="price">1 150 000 DT</span>
          <span class="location">Hammamet, Nabeul</span>
        </article>
        <article>
          <a href="/item/zzz999/"><h2>Terrain 20000 m² zone industrielle</h2></a>
          <span class="price">900 000 DT</span>
        </article>
    </body></html>"#;

    HashMap::from([
        ("https://www.tayara.tn/ads/c/Immobilier?page=1".to_string(), listing_page.to_string()),
        (
            "https://www.tayara.tn/item/abc123/".to_string(),
            "<html><body><p>Bel appartement, 1 salle de bain, étage 2</p></body></html>".to_string(),
        ),
        (
            "https://www.tayara.tn/item/def456/".to_string(),
            "<html><body><p>Villa 3 salles de bain avec jardin</p></body></html>".to_string(),
        ),
        (
            "https://www.tayara.tn/item/zzz999/".to_string(),
            "<html><body><p>Terrain plat</p></body></html>".to_string(),
        ),
    ])
}

#[tokio::test]
async fn bronze_file_ingested_twice_stores_each_listing_once() {
    let dir = tempdir().expect("tempdir");
    let bronze_dir = dir.path().join("bronze");
    let scraper = SourceScraper::new(
        Arc::new(FixtureBrowser {
            pages: tayara_fixtures(),
        }),
        BronzeStore::new(&bronze_dir),
    );
    let manager = ScraperManager::new(Arc::new(scraper));

    let config = ScraperConfig::new(SourceId::Tayara)
        .with_max_pages(1)
        .with_delays(0, 0);
    let results = manager.scrape_all(&[config]).await;

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.success, "{:?}", result.errors);
    // the oversized plot is rejected by the validator
    assert_eq!(result.properties_scraped, 2);

    let path = result.file_path.clone().expect("bronze path");
    let store = Arc::new(MemoryListingStore::new());
    let ingestor = Ingestor::new(store.clone());

    let first = ingestor.ingest_file(Path::new(&path)).await.expect("first ingest");
    assert_eq!(first.source.as_deref(), Some("tayara"));
    assert_eq!(first.total, 2);
    assert_eq!(first.success, 2);

    let second = ingestor.ingest_file(Path::new(&path)).await.expect("second ingest");
    assert_eq!(second.success, 0);
    assert_eq!(second.duplicates, 2);

    let rows = store.snapshot().await;
    assert_eq!(rows.len(), 2);
    let urls = rows
        .iter()
        .filter_map(|r| r.source_url.as_deref())
        .collect::<Vec<_>>();
    assert!(urls.contains(&"https://www.tayara.tn/item/abc123/"));
    assert!(urls.contains(&"https://www.tayara.tn/item/def456/"));
    let villa = rows
        .iter()
        .find(|r| r.title.starts_with("Villa"))
        .expect("villa row");
    assert_eq!(villa.governorate.as_deref(), Some("Nabeul"));
    assert_eq!(villa.price, Some(1_150_000.0));
}
